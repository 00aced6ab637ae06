//! Per-script error types.

use std::time::Duration;

use thiserror::Error;

/// Faults raised while executing one script. The engine catches every
/// variant and converts it into a denying outcome; none propagate raw.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script size {actual} bytes exceeds limit of {max} bytes")]
    CodeTooLarge { max: usize, actual: usize },
    #[error("instruction limit exceeded")]
    InstructionLimit,
    #[error("script timeout after {0:?}")]
    Timeout(Duration),
    #[error("script evaluation failed: {0}")]
    Evaluation(String),
    #[error("script output is not representable as JSON: {0}")]
    Output(String),
    #[error("sandbox internal error: {0}")]
    Internal(String),
}
