//! Trace/span repository. Writes are best-effort; failures never reach the
//! caller path (the persister logs and swallows them).

use async_trait::async_trait;
use parking_lot::RwLock;

use super::StoreError;
use crate::model::{Span, Trace};

#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn create_trace(&self, trace: Trace) -> Result<(), StoreError>;
    async fn create_spans(&self, spans: Vec<Span>) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryTraceStore {
    traces: RwLock<Vec<Trace>>,
    spans: RwLock<Vec<Span>>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<Trace> {
        self.traces.read().clone()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.read().clone()
    }
}

#[async_trait]
impl TraceStore for InMemoryTraceStore {
    async fn create_trace(&self, trace: Trace) -> Result<(), StoreError> {
        self.traces.write().push(trace);
        Ok(())
    }

    async fn create_spans(&self, spans: Vec<Span>) -> Result<(), StoreError> {
        self.spans.write().extend(spans);
        Ok(())
    }
}
