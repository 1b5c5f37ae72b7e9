//! Work queue abstraction for the pipeline's producer/consumer stages.
//!
//! The trait keeps the pipeline independent of the queue backing; the
//! in-memory MPSC implementation is the only backend a single-process
//! runtime needs, but the seam leaves room for persistent ones.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

mod mpsc;

pub use mpsc::MpscWorkQueue;

/// Generic bounded work queue shared by producers and a pool of consumers.
#[async_trait]
pub trait WorkQueue<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Push an item, waiting for space when the queue is full.
    async fn push(&self, item: T) -> Result<()>;

    /// Push without blocking; fails when the queue is full or closed.
    async fn try_push(&self, item: T) -> Result<()> {
        self.push(item).await
    }

    /// Pull the next item, waiting until one is available or the queue closes.
    async fn pull(&self) -> Option<T>;

    /// Pull with a bounded wait so consumers can observe cancellation
    /// promptly. Returns `None` on timeout or when the queue is closed.
    async fn pull_timeout(&self, wait: Duration) -> Option<T>;

    /// Number of buffered items, when the backend can report it.
    async fn depth(&self) -> Option<usize> {
        None
    }

    /// Whether the queue can still accept items.
    fn is_healthy(&self) -> bool {
        true
    }
}
