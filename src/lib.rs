//! flowgate: a fail-secure pipeline engine for sandboxed policy scripts.
//!
//! A trigger event maps to an execution plan of ordered layers; scripts in a
//! layer run concurrently in isolated JavaScript sandboxes with hard size,
//! instruction, and wall-clock budgets. Any denial, script error, or resource
//! violation blocks the triggering operation; allowed runs merge script
//! outputs into an accumulated context handed back to the caller. Every run
//! leaves a trace with one span per executed script.
//!
//! [`engine::PipelineEngine`] is the entry point; build one with
//! [`engine::PipelineEngineBuilder`].

pub mod bridge;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod pool;
pub mod sandbox;
pub mod store;
pub mod trace;

pub use engine::{PipelineEngine, PipelineEngineBuilder, TriggerOutcome};
pub use error::{EngineError, ScriptError};
pub use model::{ExecutionPlan, RunMetadata, Script, ScriptOutcome, Span, SpanStatus, Trace, TraceStatus};
pub use policy::SafetyPolicy;
