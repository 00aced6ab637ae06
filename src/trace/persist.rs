//! Background trace persistence.
//!
//! Traces and spans are handed to a dedicated task over a channel instead of
//! being written inline on the latency-sensitive path. Store failures are
//! logged and swallowed; they never affect the caller's result. `flush`
//! awaits queue drain so tests can observe completion.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::model::{Span, Trace};
use crate::store::TraceStore;

enum PersistJob {
    Record { trace: Trace, spans: Vec<Span> },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct TracePersister {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl TracePersister {
    /// Spawns the worker task. Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn TraceStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    PersistJob::Record { trace, spans } => {
                        let trace_id = trace.id;
                        if let Err(err) = store.create_trace(trace).await {
                            tracing::warn!(%trace_id, error = %err, "failed to persist trace");
                        }
                        if let Err(err) = store.create_spans(spans).await {
                            tracing::warn!(%trace_id, error = %err, "failed to persist spans");
                        }
                    }
                    PersistJob::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Fire-and-forget hand-off to the worker.
    pub fn enqueue(&self, trace: Trace, spans: Vec<Span>) {
        if self.tx.send(PersistJob::Record { trace, spans }).is_err() {
            tracing::warn!("trace persister is gone; dropping trace");
        }
    }

    /// Resolves once every job enqueued before the call has been processed.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistJob::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}
