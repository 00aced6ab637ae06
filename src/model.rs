//! Core data model: scripts, execution plans, per-run context, traces and spans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifier of a stored script. Plans reference scripts by this id.
pub type ScriptId = String;

/// A user-authored policy/enrichment script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: ScriptId,
    pub name: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// Maps one trigger event to an ordered list of layers. Scripts within a
/// layer run concurrently; layers run strictly in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub trigger_event: String,
    pub layers: Vec<Vec<ScriptId>>,
}

/// Result of one script execution. `allowed` defaults to true when the
/// script returns no verdict; only a literal `false` blocks the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Default for ScriptOutcome {
    fn default() -> Self {
        Self {
            allowed: true,
            error: None,
            data: None,
        }
    }
}

impl ScriptOutcome {
    /// Interprets a script completion value.
    ///
    /// `allowed` passes for anything except a literal `false`. A missing or
    /// null completion value is allowed when `fail_open_on_nil` is set,
    /// denied otherwise.
    pub fn from_completion(value: Option<Value>, fail_open_on_nil: bool) -> Self {
        match value {
            None | Some(Value::Null) => {
                if fail_open_on_nil {
                    Self {
                        allowed: true,
                        error: None,
                        data: None,
                    }
                } else {
                    Self {
                        allowed: false,
                        error: Some("script produced no outcome".to_string()),
                        data: None,
                    }
                }
            }
            Some(Value::Object(map)) => {
                let allowed = map.get("allowed") != Some(&Value::Bool(false));
                let error = map
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let data = map.get("data").cloned().filter(|v| !v.is_null());
                Self {
                    allowed,
                    error,
                    data,
                }
            }
            Some(_) => Self {
                allowed: true,
                error: None,
                data: None,
            },
        }
    }

    pub fn deny(error: impl Into<String>) -> Self {
        Self {
            allowed: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

/// The three read models exposed to scripts during one run.
///
/// `data` accumulates merged output across all completed scripts (seeded
/// with the caller context), `prev` holds only the merged output of the
/// immediately preceding layer, `outputs` keeps the exact output of each
/// script for the whole run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub data: Map<String, Value>,
    pub prev: Map<String, Value>,
    pub outputs: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(seed: &Value) -> Self {
        let data = match seed {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Self {
            data,
            prev: Map::new(),
            outputs: Map::new(),
        }
    }

    /// JSON view injected into the sandbox as the `context` global.
    pub fn snapshot(&self, trigger_event: &str) -> Value {
        serde_json::json!({
            "trigger": trigger_event,
            "data": self.data,
            "prev": self.prev,
            "outputs": self.outputs,
        })
    }

    pub fn record_output(&mut self, script_id: &str, output: Value) {
        self.outputs.insert(script_id.to_string(), output);
    }

    /// Folds a completed layer into the run: the merged layer map replaces
    /// `prev` and overrides colliding keys in the accumulated `data`.
    pub fn apply_layer(&mut self, merged: Map<String, Value>) {
        for (key, value) in &merged {
            self.data.insert(key.clone(), value.clone());
        }
        self.prev = merged;
    }
}

/// Run identity and caller attribution forwarded into the trace.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    pub user_id: Option<String>,
    pub request_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Success,
    Blocked,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Success,
    Blocked,
    Error,
    Skipped,
}

/// One record per run, write-once, persisted best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: Uuid,
    pub trigger_event: String,
    pub status: TraceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_ip: Option<String>,
    pub context_snapshot: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
}

/// One record per script execution, plus optional user-declared nested spans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: Uuid,
    pub trace_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_id: Option<ScriptId>,
    pub name: String,
    pub layer_index: usize,
    pub parallel_index: usize,
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<Uuid>,
}
