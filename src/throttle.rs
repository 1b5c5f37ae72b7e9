//! Provider back-off records layered on a shared cache instance.
//!
//! A provider is "limited" while `now < stored_at + reset_seconds` for its
//! record in the rate cache. Callers pre-check with `is_limited` before any
//! outbound call and mark the provider immediately on a 429-class response;
//! the call that hit the limit is never retried in place.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::storage::DurableTtlCache;

#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<DurableTtlCache>,
    poll_interval: Duration,
}

impl RateLimiter {
    pub fn new(cache: Arc<DurableTtlCache>, poll_interval: Duration) -> Self {
        Self {
            cache,
            poll_interval,
        }
    }

    /// Record that `provider` is unavailable for the next `reset_seconds`.
    pub fn mark_limited(&self, provider: &str, reset_seconds: u64) {
        debug!(provider, reset_seconds, "Provider marked rate limited");
        self.cache.add(provider, json!(reset_seconds));
    }

    /// Whether `provider` currently has an unexpired back-off record.
    ///
    /// An expired or malformed record is removed as a side effect.
    pub fn is_limited(&self, provider: &str) -> bool {
        let (value, stored_at) = match self.cache.get_entry(provider) {
            Some(entry) => entry,
            None => return false,
        };

        let reset_seconds = match value.as_u64() {
            Some(seconds) => seconds,
            None => {
                warn!(provider, "Malformed rate limit record, removing");
                self.cache.remove(provider);
                return false;
            }
        };

        let clear_at = stored_at + chrono::Duration::seconds(reset_seconds as i64);
        if chrono::Utc::now() < clear_at {
            true
        } else {
            self.cache.remove(provider);
            false
        }
    }

    /// Drop the record for `provider`, typically after a successful call.
    pub fn clear(&self, provider: &str) {
        self.cache.remove(provider);
    }

    /// Block in short cancellable increments until the provider clears.
    ///
    /// Returns `false` when cancelled before the record expired.
    pub async fn wait_until_clear(&self, provider: &str, cancel: &CancellationToken) -> bool {
        while self.is_limited(provider) {
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = cancel.cancelled() => {
                    return false;
                }
            }
        }
        self.cache.remove(provider);
        true
    }
}
