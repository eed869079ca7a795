//! Cooperative cancellation for long-running operations.
//!
//! Ingestion checks the token between windows and between entry writes; the
//! agent checks it between iterations. Nothing is interrupted mid-write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ArielError, Result};

/// Cloneable cancellation flag shared between a caller and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(ArielError::Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArielError::Cancelled)
        } else {
            Ok(())
        }
    }
}
