//! Repository seams consumed by the engine.
//!
//! Persistence backends are external collaborators; the engine only sees
//! these traits. In-memory implementations back the defaults and the tests.

pub mod plan;
pub mod script;
pub mod trace;

pub use plan::{InMemoryPlanStore, PlanStore};
pub use script::{InMemoryScriptStore, ScriptStore};
pub use trace::{InMemoryTraceStore, TraceStore};

use thiserror::Error;

/// Errors surfaced by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}
