//! Shared session validity gate.
//!
//! When a collaborator reports that its authorization/session has expired,
//! workers park on the gate instead of terminating, and resume once validity
//! is restored. Waits are short cancellable polls so shutdown latency stays
//! bounded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct SessionGate {
    valid: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl SessionGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            valid: Arc::new(AtomicBool::new(true)),
            poll_interval,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn mark_invalid(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            warn!("Session marked invalid, dependent workers will pause");
        }
    }

    pub fn mark_valid(&self) {
        if !self.valid.swap(true, Ordering::AcqRel) {
            info!("Session restored, dependent workers may resume");
        }
    }

    /// Block until the session is valid again. Returns `false` when the
    /// cancellation token fires first.
    pub async fn wait_until_valid(&self, cancel: &CancellationToken) -> bool {
        while !self.is_valid() {
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = cancel.cancelled() => {
                    return false;
                }
            }
        }
        true
    }
}
