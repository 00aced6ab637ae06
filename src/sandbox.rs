//! Script execution wrapper.
//!
//! Runs one script in a fresh boa context on a blocking thread: runtime
//! limits installed from the safety policy, `host` and `context` injected as
//! the only globals, the completion value converted back to JSON. Execution
//! races against the per-script wall-clock timeout; every fault converts to
//! a [`ScriptError`] and the interpreter slot is released on all paths.

use std::sync::Arc;

use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsError, Source};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::bridge::HostBridge;
use crate::error::ScriptError;
use crate::policy::SafetyPolicy;
use crate::pool::InterpreterHandle;
use crate::trace::{SpanRecorder, SpanScope};

/// Guards against runaway recursion independently of the loop budget.
const RECURSION_LIMIT: usize = 512;

/// One prepared sandbox run.
pub struct SandboxJob {
    pub code: String,
    /// JSON view of the run context, injected as the `context` global.
    pub context_json: Value,
    pub scope: SpanScope,
}

/// Executes a script to completion or error, racing the policy's wall-clock
/// timeout. On timeout the blocking thread is abandoned; its pool slot frees
/// once the interpreter trips the instruction budget.
pub async fn execute_script(
    handle: InterpreterHandle,
    bridge: Arc<HostBridge>,
    policy: &SafetyPolicy,
    recorder: Arc<SpanRecorder>,
    job: SandboxJob,
) -> Result<Option<Value>, ScriptError> {
    let runtime = Handle::current();
    let max_instructions = policy.max_instructions;
    let timeout = policy.script_timeout;

    let task = tokio::task::spawn_blocking(move || {
        let result = run_blocking(&bridge, recorder, runtime, max_instructions, job);
        drop(handle);
        result
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ScriptError::Internal(join_err.to_string())),
        Err(_) => Err(ScriptError::Timeout(timeout)),
    }
}

fn run_blocking(
    bridge: &HostBridge,
    recorder: Arc<SpanRecorder>,
    runtime: Handle,
    max_instructions: u64,
    job: SandboxJob,
) -> Result<Option<Value>, ScriptError> {
    let mut context = Context::default();

    let limits = context.runtime_limits_mut();
    limits.set_loop_iteration_limit(max_instructions);
    limits.set_recursion_limit(RECURSION_LIMIT);

    let context_value = boa_engine::JsValue::from_json(&job.context_json, &mut context)
        .map_err(|e| ScriptError::Internal(format!("failed to inject context: {e}")))?;
    context
        .register_global_property(js_string!("context"), context_value, Attribute::all())
        .map_err(|e| ScriptError::Internal(format!("failed to register context: {e}")))?;

    bridge
        .install(&mut context, job.scope, recorder, runtime)
        .map_err(|e| ScriptError::Internal(format!("failed to install host bridge: {e}")))?;

    match context.eval(Source::from_bytes(job.code.as_bytes())) {
        Ok(value) if value.is_undefined() || value.is_null() => Ok(None),
        Ok(value) => value
            .to_json(&mut context)
            .map(Some)
            .map_err(|e| ScriptError::Output(e.to_string())),
        Err(err) => Err(classify_js_error(err)),
    }
}

/// Budget trips surface from boa as runtime-limit errors; everything else
/// is a plain authoring fault.
fn classify_js_error(err: JsError) -> ScriptError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("iteration limit") || lowered.contains("recursion limit") {
        ScriptError::InstructionLimit
    } else {
        ScriptError::Evaluation(message)
    }
}
