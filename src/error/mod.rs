//! Error types for the pipeline engine.
//!
//! - [`ScriptError`] — Faults raised while executing one sandboxed script.
//! - [`EngineError`] — Plan-level and configuration errors.

pub mod engine_error;
pub mod script_error;

pub use engine_error::EngineError;
pub use script_error::ScriptError;
