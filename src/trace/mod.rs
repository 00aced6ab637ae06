//! Tracing glue: per-run span collection and out-of-band persistence.

pub mod persist;
pub mod recorder;

pub use persist::TracePersister;
pub use recorder::{SpanRecorder, SpanScope};

/// Nested spans are recorded at most this many levels below the script's
/// own span; deeper bodies still run but leave no record.
pub const NESTED_SPAN_DEPTH_CAP: usize = 2;
