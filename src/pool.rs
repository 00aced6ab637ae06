//! Bounded interpreter pool.
//!
//! Boa contexts are not `Send`, so the pool bounds how many interpreters may
//! exist at once rather than shipping context objects between threads. An
//! acquisition reserves capacity; the execution wrapper builds a fresh,
//! fully configured context inside its blocking thread
//! (configure-on-acquire), and nothing survives the run, so pooled state can
//! never leak between callers (reset-on-release). Release is RAII: dropping
//! the handle frees the slot on success, error, and timeout paths alike.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ScriptError;

pub struct InterpreterPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl InterpreterPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits until an interpreter slot frees up.
    pub async fn acquire(&self) -> Result<InterpreterHandle, ScriptError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScriptError::Internal("interpreter pool closed".into()))?;
        Ok(InterpreterHandle { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Exclusive claim on one interpreter slot. Dropping it releases the slot.
pub struct InterpreterHandle {
    _permit: OwnedSemaphorePermit,
}
