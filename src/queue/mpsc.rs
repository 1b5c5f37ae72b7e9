//! In-memory bounded queue over a Tokio MPSC channel.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use super::WorkQueue;
use crate::errors::QueueError;

/// MPSC-backed work queue. The receiver sits behind a mutex so a pool of
/// consumers can share one queue; the sender side clones freely.
pub struct MpscWorkQueue<T>
where
    T: Send + Sync + 'static,
{
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
    sender: mpsc::Sender<T>,
}

impl<T> MpscWorkQueue<T>
where
    T: Send + Sync + 'static,
{
    /// Create a queue buffering at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            sender,
        }
    }

    pub fn max_capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

impl<T> Clone for MpscWorkQueue<T>
where
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            sender: self.sender.clone(),
        }
    }
}

#[async_trait]
impl<T> WorkQueue<T> for MpscWorkQueue<T>
where
    T: Send + Sync + 'static,
{
    async fn push(&self, item: T) -> Result<()> {
        self.sender
            .send(item)
            .await
            .map_err(|_| QueueError::Closed)?;
        Ok(())
    }

    async fn try_push(&self, item: T) -> Result<()> {
        self.sender.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => QueueError::CapacityExceeded {
                capacity: self.sender.max_capacity(),
            },
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        Ok(())
    }

    async fn pull(&self) -> Option<T> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    async fn pull_timeout(&self, wait: Duration) -> Option<T> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(item) => item,
            Err(_) => {
                trace!("Queue pull timed out");
                None
            }
        }
    }

    async fn depth(&self) -> Option<usize> {
        // Approximate: items buffered = capacity currently consumed.
        Some(self.sender.max_capacity() - self.sender.capacity())
    }

    fn is_healthy(&self) -> bool {
        !self.sender.is_closed()
    }
}
