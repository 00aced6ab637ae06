//! Plan-level error types.

use thiserror::Error;

/// Errors raised before any script runs: plan shape violations and engine
/// configuration problems. A violation rejects the run without a trace.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chain depth {actual} exceeds limit of {max} layers")]
    ChainDepthExceeded { actual: usize, max: usize },
    #[error("layer {layer} exceeds parallel nodes limit: {actual} > {max}")]
    ParallelNodesExceeded {
        layer: usize,
        actual: usize,
        max: usize,
    },
    #[error("engine configuration error: {0}")]
    Configuration(String),
}
