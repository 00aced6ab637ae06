//! End-to-end pipeline behavior: layering, fail-secure blocking, resource
//! limits, context merging, and trace recording.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use flowgate::store::{
    InMemoryPlanStore, InMemoryScriptStore, InMemoryTraceStore, PlanStore, ScriptStore,
};
use flowgate::{PipelineEngine, RunMetadata, SafetyPolicy, Script, SpanStatus, TraceStatus};

struct Harness {
    engine: PipelineEngine,
    traces: Arc<InMemoryTraceStore>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn harness(
    scripts: &[(&str, &str)],
    layers: Vec<Vec<&str>>,
    policy: SafetyPolicy,
) -> Harness {
    init_tracing();
    let script_store = Arc::new(InMemoryScriptStore::new());
    for (id, code) in scripts {
        script_store
            .create(Script {
                id: id.to_string(),
                name: id.to_string(),
                code: code.to_string(),
                config: None,
            })
            .await
            .unwrap();
    }

    let plan_store = Arc::new(InMemoryPlanStore::new());
    plan_store
        .set(
            "before_signup",
            layers
                .into_iter()
                .map(|l| l.into_iter().map(String::from).collect())
                .collect(),
        )
        .await
        .unwrap();

    let traces = Arc::new(InMemoryTraceStore::new());
    let engine = PipelineEngine::builder()
        .script_store(script_store)
        .plan_store(plan_store)
        .trace_store(traces.clone())
        .policy(policy)
        .build()
        .unwrap();

    Harness { engine, traces }
}

#[tokio::test]
async fn test_no_plan_allows_without_trace() {
    let h = harness(&[], vec![], SafetyPolicy::default()).await;

    let outcome = h
        .engine
        .execute_trigger("unknown_trigger", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(outcome.allowed);
    assert!(outcome.error.is_none());
    assert!(h.traces.traces().is_empty());
    assert!(h.traces.spans().is_empty());
}

#[tokio::test]
async fn test_chain_depth_violation_denies_without_running() {
    let policy = SafetyPolicy {
        max_chain_depth: 2,
        ..SafetyPolicy::default()
    };
    let h = harness(
        &[("a", "({})")],
        vec![vec!["a"], vec!["a"], vec!["a"]],
        policy,
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(!outcome.allowed);
    assert!(outcome.error.unwrap().contains("chain depth"));
    // Structural rejection happens before any script runs, so no trace.
    assert!(h.traces.traces().is_empty());
}

#[tokio::test]
async fn test_parallel_nodes_violation_denies() {
    let policy = SafetyPolicy {
        max_parallel_nodes: 2,
        ..SafetyPolicy::default()
    };
    let h = harness(&[("a", "({})")], vec![vec!["a", "a", "a"]], policy).await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;

    assert!(!outcome.allowed);
    assert!(outcome.error.unwrap().contains("parallel nodes"));
}

#[tokio::test]
async fn test_oversized_script_denies_with_error_span() {
    let policy = SafetyPolicy {
        max_script_bytes: 8,
        ..SafetyPolicy::default()
    };
    let h = harness(
        &[("big", "({ data: { padding: 'xxxxxxxxxxxxxxxx' } })")],
        vec![vec!["big"]],
        policy,
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(!outcome.allowed);
    assert!(outcome.error.unwrap().contains("exceeds limit"));

    let spans = h.traces.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, SpanStatus::Error);

    let traces = h.traces.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, TraceStatus::Blocked);
}

#[tokio::test]
async fn test_unbounded_loop_denied_within_twice_timeout() {
    // Budget big enough that the wall clock wins the race, small enough
    // that the abandoned thread trips it shortly after.
    let policy = SafetyPolicy {
        script_timeout: Duration::from_millis(200),
        max_instructions: 20_000_000,
        ..SafetyPolicy::default()
    };
    let h = harness(&[("spin", "while (true) {}")], vec![vec!["spin"]], policy).await;

    let start = Instant::now();
    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    let elapsed = start.elapsed();

    assert!(!outcome.allowed);
    assert!(
        elapsed < Duration::from_millis(400),
        "denial took {elapsed:?}, expected under twice the timeout"
    );
    assert!(outcome.error.unwrap().contains("blocked by script 'spin'"));
}

#[tokio::test]
async fn test_instruction_budget_trips_before_wall_clock() {
    let policy = SafetyPolicy {
        max_instructions: 10_000,
        script_timeout: Duration::from_secs(10),
        ..SafetyPolicy::default()
    };
    let h = harness(&[("spin", "while (true) {}")], vec![vec!["spin"]], policy).await;

    let start = Instant::now();
    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;

    assert!(!outcome.allowed);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(outcome.error.unwrap().contains("instruction limit"));
}

#[tokio::test]
async fn test_silent_script_allows_when_fail_open() {
    let h = harness(
        &[("quiet", "let x = 1 + 1;")],
        vec![vec!["quiet"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;

    assert!(outcome.allowed);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn test_silent_script_denies_when_fail_closed() {
    let policy = SafetyPolicy {
        fail_open_on_nil: false,
        ..SafetyPolicy::default()
    };
    let h = harness(&[("quiet", "let x = 1 + 1;")], vec![vec!["quiet"]], policy).await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;

    assert!(!outcome.allowed);
    assert!(outcome.error.unwrap().contains("no outcome"));
}

#[tokio::test]
async fn test_prev_propagates_between_layers() {
    let h = harness(
        &[
            ("first", "({ data: { score: 42 } })"),
            (
                "second",
                "({ data: { doubled: context.prev.score * 2 } })",
            ),
        ],
        vec![vec!["first"], vec!["second"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;

    assert!(outcome.allowed);
    let data = outcome.data.unwrap();
    assert_eq!(data["score"], json!(42));
    assert_eq!(data["doubled"], json!(84));
}

#[tokio::test]
async fn test_diamond_plan_merges_in_declared_order() {
    let h = harness(
        &[
            ("seed", "({ data: { base: 1 } })"),
            ("left", "({ data: { tag: 'left', l: true } })"),
            ("right", "({ data: { tag: 'right', r: true } })"),
            (
                "join",
                "({ data: { all: [context.outputs.left.tag, context.outputs.right.tag] } })",
            ),
        ],
        vec![vec!["seed"], vec!["left", "right"], vec!["join"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;

    assert!(outcome.allowed);
    let data = outcome.data.unwrap();
    assert_eq!(data["base"], json!(1));
    assert_eq!(data["l"], json!(true));
    assert_eq!(data["r"], json!(true));
    // Declared-later sibling wins the colliding key.
    assert_eq!(data["tag"], json!("right"));
    assert_eq!(data["all"], json!(["left", "right"]));
}

#[tokio::test]
async fn test_outputs_keeps_exact_script_results() {
    let h = harness(
        &[
            ("probe", "({ allowed: true, data: { n: 7 } })"),
            ("reader", "({ data: { seen: context.outputs.probe.n } })"),
        ],
        vec![vec!["probe"], vec!["reader"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;

    assert!(outcome.allowed);
    assert_eq!(outcome.data.unwrap()["seen"], json!(7));
}

#[tokio::test]
async fn test_sibling_scripts_start_together() {
    let policy = SafetyPolicy {
        max_instructions: 100_000_000,
        ..SafetyPolicy::default()
    };
    let busy = "let t = host.now(); while (host.now() - t < 150) {} ({})";
    let h = harness(
        &[("slow_a", busy), ("slow_b", busy), ("slow_c", busy)],
        vec![vec!["slow_a", "slow_b", "slow_c"]],
        policy,
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(outcome.allowed);
    let spans = h.traces.spans();
    assert_eq!(spans.len(), 3);
    let earliest = spans.iter().map(|s| s.started_at).min().unwrap();
    let latest = spans.iter().map(|s| s.started_at).max().unwrap();
    let gap = (latest - earliest).num_milliseconds();
    assert!(gap < 20, "sibling spans started {gap}ms apart");
}

#[tokio::test]
async fn test_one_denier_blocks_but_all_sibling_spans_recorded() {
    let h = harness(
        &[
            ("pass_a", "({ data: { a: 1 } })"),
            ("deny", "({ allowed: false, error: 'too risky' })"),
            ("pass_b", "({ data: { b: 2 } })"),
        ],
        vec![vec!["pass_a", "deny", "pass_b"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(!outcome.allowed);
    assert_eq!(
        outcome.error.unwrap(),
        "blocked by script 'deny': too risky"
    );

    // The whole layer settles before the verdict; every sibling leaves a
    // span even though one denied.
    let spans = h.traces.spans();
    assert_eq!(spans.len(), 3);
    let denier = spans.iter().find(|s| s.name == "deny").unwrap();
    assert_eq!(denier.status, SpanStatus::Blocked);
    assert!(spans
        .iter()
        .filter(|s| s.name != "deny")
        .all(|s| s.status == SpanStatus::Success));

    let traces = h.traces.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, TraceStatus::Blocked);
    assert!(traces[0]
        .status_message
        .as_deref()
        .unwrap()
        .contains("too risky"));
}

#[tokio::test]
async fn test_missing_script_is_skipped_not_blocking() {
    let h = harness(
        &[("real", "({ data: { ok: true } })")],
        vec![vec!["real", "ghost"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(outcome.allowed);
    assert_eq!(outcome.data.unwrap()["ok"], json!(true));

    let spans = h.traces.spans();
    let ghost = spans.iter().find(|s| s.name == "ghost").unwrap();
    assert_eq!(ghost.status, SpanStatus::Skipped);
    assert_eq!(ghost.status_message.as_deref(), Some("script not found"));
}

#[tokio::test]
async fn test_runtime_error_denies_with_error_span() {
    let h = harness(
        &[("broken", "undefinedFunction()")],
        vec![vec!["broken"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(!outcome.allowed);
    assert!(outcome
        .error
        .unwrap()
        .contains("blocked by script 'broken'"));

    let spans = h.traces.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, SpanStatus::Error);
}

#[tokio::test]
async fn test_disallowed_fetch_denies_run() {
    // Default bridge config has an empty fetch allow-list.
    let h = harness(
        &[("fetcher", "host.fetch('https://api.example.com/check'); ({})")],
        vec![vec!["fetcher"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(!outcome.allowed);
    assert!(outcome.error.unwrap().contains("not allowed"));

    let spans = h.traces.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, SpanStatus::Error);
}

#[tokio::test]
async fn test_nested_spans_recorded_up_to_cap() {
    let code = r#"
        host.span('level1', { check: 'outer' }, () => {
            host.span('level2', () => {
                host.span('level3', () => 7);
            });
        });
        ({})
    "#;
    let h = harness(&[("spanner", code)], vec![vec!["spanner"]], SafetyPolicy::default()).await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(outcome.allowed);
    let spans = h.traces.spans();
    // Script span plus two nested levels; the third ran but left no record.
    assert_eq!(spans.len(), 3);
    assert!(spans.iter().any(|s| s.name == "level1"));
    assert!(spans.iter().any(|s| s.name == "level2"));
    assert!(!spans.iter().any(|s| s.name == "level3"));

    let script_span = spans.iter().find(|s| s.name == "spanner").unwrap();
    let level1 = spans.iter().find(|s| s.name == "level1").unwrap();
    let level2 = spans.iter().find(|s| s.name == "level2").unwrap();
    assert_eq!(level1.parent_span_id, Some(script_span.id));
    assert_eq!(level2.parent_span_id, Some(level1.id));
    assert_eq!(level1.attributes, Some(json!({ "check": "outer" })));
}

#[tokio::test]
async fn test_context_snapshot_and_result_recorded_on_success() {
    let h = harness(
        &[("enrich", "({ data: { verdict: 'clean' } })")],
        vec![vec!["enrich"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger(
            "before_signup",
            json!({ "email": "a@b.c" }),
            Some(RunMetadata {
                user_id: Some("u-1".into()),
                request_ip: Some("10.0.0.1".into()),
            }),
        )
        .await;
    h.engine.flush_traces().await;

    assert!(outcome.allowed);

    let traces = h.traces.traces();
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.status, TraceStatus::Success);
    assert_eq!(trace.trigger_event, "before_signup");
    assert_eq!(trace.user_id.as_deref(), Some("u-1"));
    assert_eq!(trace.request_ip.as_deref(), Some("10.0.0.1"));
    assert_eq!(trace.context_snapshot["email"], json!("a@b.c"));
    let result = trace.result_data.as_ref().unwrap();
    assert_eq!(result["verdict"], json!("clean"));
    assert_eq!(result["email"], json!("a@b.c"));
}

#[tokio::test]
async fn test_plan_store_failure_denies() {
    use async_trait::async_trait;
    use flowgate::model::{ExecutionPlan, ScriptId};
    use flowgate::store::StoreError;

    struct FailingPlanStore;

    #[async_trait]
    impl PlanStore for FailingPlanStore {
        async fn get(&self, _trigger: &str) -> Result<Option<ExecutionPlan>, StoreError> {
            Err(StoreError::Backend("connection reset".into()))
        }
        async fn set(
            &self,
            _trigger: &str,
            _layers: Vec<Vec<ScriptId>>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    let engine = PipelineEngine::builder()
        .plan_store(Arc::new(FailingPlanStore))
        .build()
        .unwrap();

    let outcome = engine.execute_trigger("anything", json!({}), None).await;
    assert!(!outcome.allowed);
    assert!(outcome.error.unwrap().contains("plan lookup failed"));
}

#[tokio::test]
async fn test_layer_stops_pipeline_no_later_layer_runs() {
    let h = harness(
        &[
            ("deny", "({ allowed: false, error: 'nope' })"),
            ("after", "({ data: { ran: true } })"),
        ],
        vec![vec!["deny"], vec!["after"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    h.engine.flush_traces().await;

    assert!(!outcome.allowed);
    // Only the denying layer's span exists; the next layer never launched.
    let spans = h.traces.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "deny");
}

#[tokio::test]
async fn test_non_object_seed_yields_empty_data() {
    let h = harness(
        &[("noop", "({})")],
        vec![vec!["noop"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!("just a string"), None)
        .await;

    assert!(outcome.allowed);
    assert_eq!(outcome.data.unwrap(), json!({}));
}

#[tokio::test]
async fn test_outcome_serializes_without_empty_fields() {
    let h = harness(
        &[("noop", "({})")],
        vec![vec!["noop"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;
    let encoded = serde_json::to_value(&outcome).unwrap();

    assert_eq!(encoded["allowed"], json!(true));
    assert!(encoded.get("error").is_none());
    assert_eq!(encoded["data"], json!({}));
}

#[tokio::test]
async fn test_later_layer_overrides_accumulated_data() {
    let h = harness(
        &[
            ("first", "({ data: { risk: 'low', stable: 1 } })"),
            ("second", "({ data: { risk: 'high' } })"),
        ],
        vec![vec!["first"], vec!["second"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({}), None)
        .await;

    let data = outcome.data.unwrap();
    assert_eq!(data["risk"], json!("high"));
    assert_eq!(data["stable"], json!(1));
}

#[tokio::test]
async fn test_blocked_trace_has_no_result_data() {
    let h = harness(
        &[("deny", "({ allowed: false })")],
        vec![vec!["deny"]],
        SafetyPolicy::default(),
    )
    .await;

    let outcome = h
        .engine
        .execute_trigger("before_signup", json!({ "k": 1 }), None)
        .await;
    h.engine.flush_traces().await;

    assert!(!outcome.allowed);
    let traces = h.traces.traces();
    assert_eq!(traces.len(), 1);
    assert!(traces[0].result_data.is_none());
    assert!(traces[0].context_snapshot.is_object());
}
