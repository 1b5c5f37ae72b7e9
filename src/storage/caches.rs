//! The shared cache set and its maintenance task entries.
//!
//! One `Caches` value is constructed at startup and threaded explicitly into
//! every task and pipeline worker; nothing reaches a cache through ambient
//! global state.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::storage::ttl_cache::{DurableTtlCache, TtlSpec};
use crate::tasks::descriptor::{TaskContext, TaskDescriptor, TaskEntry};

/// Reloadable unit name shared by the cache maintenance entries.
pub const MAINTENANCE_UNIT: &str = "storage::maintenance";

/// Every durable cache the runtime shares between tasks and workers.
#[derive(Clone)]
pub struct Caches {
    /// Subjects to skip entirely for a while (failed or empty fetches).
    pub ignore: Arc<DurableTtlCache>,
    /// Recently evaluated subjects and their outcomes.
    pub evaluated: Arc<DurableTtlCache>,
    /// Last subject fully processed, for resuming an interrupted run.
    pub checkpoint: Arc<DurableTtlCache>,
    /// Provider back-off records consumed by the rate limiter.
    pub rate: Arc<DurableTtlCache>,
    /// The cached subject universe supplied by collaborators.
    pub subjects: Arc<DurableTtlCache>,
}

impl Caches {
    /// Open every cache under `dir`, creating the directory if needed.
    pub async fn open(dir: &Path, autosave_interval: Duration) -> Self {
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %err, "Failed to create cache directory");
        }

        Self {
            ignore: DurableTtlCache::open(
                "IgnoreCache",
                dir.join("ignore.json"),
                TtlSpec::days(30.0),
                autosave_interval,
            )
            .await,
            evaluated: DurableTtlCache::open(
                "EvalCache",
                dir.join("evaluated.json"),
                TtlSpec::minutes(5.0),
                autosave_interval,
            )
            .await,
            checkpoint: DurableTtlCache::open(
                "CheckpointCache",
                dir.join("checkpoint.json"),
                TtlSpec::days(1.0),
                autosave_interval,
            )
            .await,
            rate: DurableTtlCache::open(
                "RateLimitCache",
                dir.join("ratelimit.json"),
                TtlSpec::days(30.0),
                autosave_interval,
            )
            .await,
            subjects: DurableTtlCache::open(
                "SubjectCache",
                dir.join("subjects.json"),
                TtlSpec::days(30.0),
                autosave_interval,
            )
            .await,
        }
    }

    pub fn all(&self) -> Vec<Arc<DurableTtlCache>> {
        vec![
            self.ignore.clone(),
            self.evaluated.clone(),
            self.checkpoint.clone(),
            self.rate.clone(),
            self.subjects.clone(),
        ]
    }

    /// Clear every cache; each clear persists the empty state immediately.
    pub async fn clear_all(&self) {
        for cache in self.all() {
            cache.clear().await;
        }
    }

    pub async fn save_all(&self) {
        for cache in self.all() {
            if let Err(err) = cache.save().await {
                warn!(cache = cache.name(), error = %err, "Cache save failed");
            }
        }
    }

    /// One orchestrator task per cache instance running its autosave loop.
    pub fn autosave_descriptors(&self) -> Vec<TaskDescriptor> {
        self.all()
            .into_iter()
            .map(|cache| {
                let name = format!("{}-autosave", cache.name());
                TaskDescriptor::new(name, MAINTENANCE_UNIT, Arc::new(AutosaveEntry { cache }))
            })
            .collect()
    }
}

/// Task entry that runs one cache's autosave loop until cancelled.
pub struct AutosaveEntry {
    cache: Arc<DurableTtlCache>,
}

impl AutosaveEntry {
    pub fn new(cache: Arc<DurableTtlCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl TaskEntry for AutosaveEntry {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        self.cache.autosave_loop(ctx.cancel).await;
        Ok(())
    }
}

/// Task entry that sweeps expired rows out of every cache and persists.
pub struct CacheJanitorEntry {
    caches: Caches,
}

impl CacheJanitorEntry {
    pub fn new(caches: Caches) -> Self {
        Self { caches }
    }
}

#[async_trait]
impl TaskEntry for CacheJanitorEntry {
    async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
        let mut evicted = 0usize;
        for cache in self.caches.all() {
            let dropped = cache.prune_expired();
            if dropped > 0 {
                if let Err(err) = cache.save().await {
                    warn!(cache = cache.name(), error = %err, "Janitor save failed");
                }
            }
            evicted += dropped;
        }
        info!(evicted, "Cache janitor sweep complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn open_creates_all_cache_files() {
        let dir = tempfile::tempdir().unwrap();
        let caches = Caches::open(dir.path(), Duration::from_secs(60)).await;

        assert_eq!(caches.all().len(), 5);
        for cache in caches.all() {
            assert!(cache.path().exists(), "missing {}", cache.path().display());
        }
    }

    #[tokio::test]
    async fn clear_all_empties_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let caches = Caches::open(dir.path(), Duration::from_secs(60)).await;

        caches.ignore.add("x", json!(1));
        caches.subjects.add("y", json!(2));
        caches.clear_all().await;

        for cache in caches.all() {
            assert!(cache.is_empty());
        }

        let raw = tokio::fs::read_to_string(caches.ignore.path()).await.unwrap();
        let rows: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(rows, json!({}));
    }

    #[tokio::test]
    async fn janitor_sweeps_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let caches = Caches::open(dir.path(), Duration::from_secs(60)).await;

        caches.evaluated.insert_with_timestamp(
            "stale",
            json!(1),
            chrono::Utc::now() - chrono::Duration::hours(2),
        );
        caches.evaluated.add("live", json!(2));

        let entry = CacheJanitorEntry::new(caches.clone());
        let ctx = TaskContext {
            name: "janitor".to_string(),
            arguments: serde_json::Value::Null,
            cancel: CancellationToken::new(),
        };
        entry.run(ctx).await.unwrap();

        assert!(!caches.evaluated.is_cached("stale"));
        assert!(caches.evaluated.is_cached("live"));
    }
}
