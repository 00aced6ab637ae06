//! Pipeline engine: layer-by-layer fail-secure orchestration.
//!
//! One orchestrating task per `execute_trigger` call. Scripts within a
//! layer fan out concurrently and the engine waits for the whole layer to
//! settle before evaluating blocking — no sibling observes another's result
//! mid-layer, and nobody cancels a sibling. Result merging follows declared
//! order deterministically regardless of completion order.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::bridge::{HostBridge, HostBridgeConfig, WebhookQueue};
use crate::error::EngineError;
use crate::model::{
    ExecutionContext, RunMetadata, ScriptOutcome, Span, SpanStatus, Trace, TraceStatus,
};
use crate::policy::SafetyPolicy;
use crate::pool::InterpreterPool;
use crate::sandbox::{execute_script, SandboxJob};
use crate::store::{
    InMemoryPlanStore, InMemoryScriptStore, InMemoryTraceStore, PlanStore, ScriptStore,
    TraceStore,
};
use crate::trace::{SpanRecorder, SpanScope, TracePersister};

/// The caller-visible result of one trigger run.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerOutcome {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TriggerOutcome {
    fn allow(data: Option<Value>) -> Self {
        Self {
            allowed: true,
            error: None,
            data,
        }
    }

    fn deny(error: impl Into<String>) -> Self {
        Self {
            allowed: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

enum NodeOutcome {
    /// Script missing from the store; dropped without blocking the layer.
    Skipped,
    Completed(ScriptOutcome),
}

struct NodeResult {
    script_id: String,
    outcome: NodeOutcome,
}

pub struct PipelineEngine {
    scripts: Arc<dyn ScriptStore>,
    plans: Arc<dyn PlanStore>,
    policy: SafetyPolicy,
    pool: InterpreterPool,
    bridge: Arc<HostBridge>,
    persister: TracePersister,
}

impl PipelineEngine {
    pub fn builder() -> PipelineEngineBuilder {
        PipelineEngineBuilder::new()
    }

    /// Runs the pipeline configured for `trigger_event`, if any.
    ///
    /// Absence of a plan means "no policy": the call allows immediately and
    /// writes no trace. Every executed run persists exactly one trace plus
    /// its spans, out of band; persistence failures never change the result.
    pub async fn execute_trigger(
        &self,
        trigger_event: &str,
        context: Value,
        metadata: Option<RunMetadata>,
    ) -> TriggerOutcome {
        let plan = match self.plans.get(trigger_event).await {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(trigger = trigger_event, error = %err, "plan lookup failed");
                return TriggerOutcome::deny(format!("execution plan lookup failed: {err}"));
            }
        };
        let Some(plan) = plan else {
            return TriggerOutcome::allow(None);
        };

        if let Err(err) = self.policy.validate_plan(&plan) {
            tracing::warn!(trigger = trigger_event, error = %err, "plan rejected");
            return TriggerOutcome::deny(err.to_string());
        }

        let trace_id = Uuid::new_v4();
        let recorder = Arc::new(SpanRecorder::new(trace_id));
        let started_at = Utc::now();
        let run_start = Instant::now();
        let snapshot = context.clone();
        let mut run_context = ExecutionContext::new(&context);

        for (layer_index, layer) in plan.layers.iter().enumerate() {
            let context_json = run_context.snapshot(trigger_event);
            let nodes = layer.iter().enumerate().map(|(parallel_index, script_id)| {
                self.run_node(
                    layer_index,
                    parallel_index,
                    script_id,
                    context_json.clone(),
                    recorder.clone(),
                )
            });
            // Fan-in barrier: every sibling settles before any verdict.
            let results = join_all(nodes).await;

            for result in &results {
                if let NodeOutcome::Completed(outcome) = &result.outcome {
                    if !outcome.allowed {
                        let reason = outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| "denied".to_string());
                        let message =
                            format!("blocked by script '{}': {}", result.script_id, reason);
                        self.persist(
                            trace_id,
                            trigger_event,
                            TraceStatus::Blocked,
                            Some(message.clone()),
                            started_at,
                            run_start,
                            snapshot.clone(),
                            None,
                            metadata.as_ref(),
                            &recorder,
                        );
                        return TriggerOutcome::deny(message);
                    }
                }
            }

            let mut layer_map = Map::new();
            for result in results {
                if let NodeOutcome::Completed(outcome) = result.outcome {
                    if let Some(data) = outcome.data {
                        run_context.record_output(&result.script_id, data.clone());
                        if let Value::Object(entries) = data {
                            // Declared order: later siblings override on
                            // key collision.
                            layer_map.extend(entries);
                        }
                    }
                }
            }
            run_context.apply_layer(layer_map);
        }

        let accumulated = Value::Object(run_context.data.clone());
        self.persist(
            trace_id,
            trigger_event,
            TraceStatus::Success,
            None,
            started_at,
            run_start,
            snapshot,
            Some(accumulated.clone()),
            metadata.as_ref(),
            &recorder,
        );
        TriggerOutcome::allow(Some(accumulated))
    }

    /// Awaits the background persister queue; used by callers that need to
    /// observe trace writes (primarily tests).
    pub async fn flush_traces(&self) {
        self.persister.flush().await;
    }

    async fn run_node(
        &self,
        layer_index: usize,
        parallel_index: usize,
        script_id: &str,
        context_json: Value,
        recorder: Arc<SpanRecorder>,
    ) -> NodeResult {
        let span_id = Uuid::new_v4();
        let started_at = Utc::now();

        let script = match self.scripts.get(script_id).await {
            Ok(Some(script)) => script,
            Ok(None) => {
                self.record_node_span(
                    &recorder,
                    span_id,
                    script_id,
                    script_id,
                    layer_index,
                    parallel_index,
                    SpanStatus::Skipped,
                    Some("script not found".to_string()),
                    started_at,
                );
                return NodeResult {
                    script_id: script_id.to_string(),
                    outcome: NodeOutcome::Skipped,
                };
            }
            Err(err) => {
                tracing::warn!(script = script_id, error = %err, "script lookup failed");
                let message = format!("script lookup failed: {err}");
                self.record_node_span(
                    &recorder,
                    span_id,
                    script_id,
                    script_id,
                    layer_index,
                    parallel_index,
                    SpanStatus::Error,
                    Some(message.clone()),
                    started_at,
                );
                return NodeResult {
                    script_id: script_id.to_string(),
                    outcome: NodeOutcome::Completed(ScriptOutcome::deny(message)),
                };
            }
        };

        if let Err(err) = self.policy.check_script_size(&script) {
            let message = err.to_string();
            self.record_node_span(
                &recorder,
                span_id,
                script_id,
                &script.name,
                layer_index,
                parallel_index,
                SpanStatus::Error,
                Some(message.clone()),
                started_at,
            );
            return NodeResult {
                script_id: script_id.to_string(),
                outcome: NodeOutcome::Completed(ScriptOutcome::deny(message)),
            };
        }

        let execution = match self.pool.acquire().await {
            Ok(handle) => {
                let job = SandboxJob {
                    code: script.code.clone(),
                    context_json,
                    scope: SpanScope {
                        trace_id: recorder.trace_id(),
                        script_span_id: span_id,
                        script_id: script_id.to_string(),
                        layer_index,
                        parallel_index,
                    },
                };
                execute_script(
                    handle,
                    self.bridge.clone(),
                    &self.policy,
                    recorder.clone(),
                    job,
                )
                .await
            }
            Err(err) => Err(err),
        };

        let (status, message, outcome) = match execution {
            Ok(completion) => {
                let outcome =
                    ScriptOutcome::from_completion(completion, self.policy.fail_open_on_nil);
                if outcome.allowed {
                    (SpanStatus::Success, outcome.error.clone(), outcome)
                } else {
                    (SpanStatus::Blocked, outcome.error.clone(), outcome)
                }
            }
            Err(err) => {
                let message = err.to_string();
                (
                    SpanStatus::Error,
                    Some(message.clone()),
                    ScriptOutcome::deny(message),
                )
            }
        };

        self.record_node_span(
            &recorder,
            span_id,
            script_id,
            &script.name,
            layer_index,
            parallel_index,
            status,
            message,
            started_at,
        );
        NodeResult {
            script_id: script_id.to_string(),
            outcome: NodeOutcome::Completed(outcome),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_node_span(
        &self,
        recorder: &SpanRecorder,
        span_id: Uuid,
        script_id: &str,
        name: &str,
        layer_index: usize,
        parallel_index: usize,
        status: SpanStatus,
        status_message: Option<String>,
        started_at: DateTime<Utc>,
    ) {
        let ended_at = Utc::now();
        recorder.record(Span {
            id: span_id,
            trace_id: recorder.trace_id(),
            script_id: Some(script_id.to_string()),
            name: name.to_string(),
            layer_index,
            parallel_index,
            status,
            status_message,
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
            attributes: None,
            parent_span_id: None,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn persist(
        &self,
        trace_id: Uuid,
        trigger_event: &str,
        status: TraceStatus,
        status_message: Option<String>,
        started_at: DateTime<Utc>,
        run_start: Instant,
        context_snapshot: Value,
        result_data: Option<Value>,
        metadata: Option<&RunMetadata>,
        recorder: &SpanRecorder,
    ) {
        let trace = Trace {
            id: trace_id,
            trigger_event: trigger_event.to_string(),
            status,
            status_message,
            started_at,
            ended_at: Utc::now(),
            duration_ms: run_start.elapsed().as_millis() as u64,
            user_id: metadata.and_then(|m| m.user_id.clone()),
            request_ip: metadata.and_then(|m| m.request_ip.clone()),
            context_snapshot,
            result_data,
        };
        self.persister.enqueue(trace, recorder.drain());
    }
}

/// Assembles a [`PipelineEngine`] from its collaborators, defaulting to
/// in-memory stores and a detached webhook queue.
pub struct PipelineEngineBuilder {
    scripts: Option<Arc<dyn ScriptStore>>,
    plans: Option<Arc<dyn PlanStore>>,
    traces: Option<Arc<dyn TraceStore>>,
    policy: SafetyPolicy,
    bridge: HostBridgeConfig,
    webhooks: Option<WebhookQueue>,
    pool_capacity: usize,
}

impl PipelineEngineBuilder {
    pub fn new() -> Self {
        Self {
            scripts: None,
            plans: None,
            traces: None,
            policy: SafetyPolicy::default(),
            bridge: HostBridgeConfig::default(),
            webhooks: None,
            pool_capacity: 8,
        }
    }

    pub fn script_store(mut self, store: Arc<dyn ScriptStore>) -> Self {
        self.scripts = Some(store);
        self
    }

    pub fn plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.plans = Some(store);
        self
    }

    pub fn trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.traces = Some(store);
        self
    }

    pub fn policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn bridge_config(mut self, config: HostBridgeConfig) -> Self {
        self.bridge = config;
        self
    }

    pub fn webhook_queue(mut self, queue: WebhookQueue) -> Self {
        self.webhooks = Some(queue);
        self
    }

    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Must be called from within a Tokio runtime (the trace persister
    /// spawns its worker here).
    pub fn build(self) -> Result<PipelineEngine, EngineError> {
        let scripts = self
            .scripts
            .unwrap_or_else(|| Arc::new(InMemoryScriptStore::new()));
        let plans = self
            .plans
            .unwrap_or_else(|| Arc::new(InMemoryPlanStore::new()));
        let traces = self
            .traces
            .unwrap_or_else(|| Arc::new(InMemoryTraceStore::new()));
        let webhooks = self.webhooks.unwrap_or_else(WebhookQueue::detached);

        let bridge = HostBridge::new(self.bridge, webhooks)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        Ok(PipelineEngine {
            scripts,
            plans,
            policy: self.policy,
            pool: InterpreterPool::new(self.pool_capacity),
            bridge: Arc::new(bridge),
            persister: TracePersister::spawn(traces),
        })
    }
}

impl Default for PipelineEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
