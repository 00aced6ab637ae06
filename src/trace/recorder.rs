//! Span collection for one run.

use parking_lot::Mutex;
use uuid::Uuid;

use crate::model::{ScriptId, Span};

/// Collects every span of one run under a single trace id. Shared between
/// the orchestrating task and the sandbox threads of a layer.
pub struct SpanRecorder {
    trace_id: Uuid,
    spans: Mutex<Vec<Span>>,
}

impl SpanRecorder {
    pub fn new(trace_id: Uuid) -> Self {
        Self {
            trace_id,
            spans: Mutex::new(Vec::new()),
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn record(&self, span: Span) {
        self.spans.lock().push(span);
    }

    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.lock().is_empty()
    }

    /// Takes all spans collected so far, leaving the recorder empty.
    pub fn drain(&self) -> Vec<Span> {
        std::mem::take(&mut *self.spans.lock())
    }
}

/// Identity of one script execution, handed to the sandbox so nested spans
/// attach to the right trace, script span, and layer position.
#[derive(Debug, Clone)]
pub struct SpanScope {
    pub trace_id: Uuid,
    pub script_span_id: Uuid,
    pub script_id: ScriptId,
    pub layer_index: usize,
    pub parallel_index: usize,
}
