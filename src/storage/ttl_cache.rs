//! Durable key/value cache with per-instance TTL and crash-safe persistence.
//!
//! Each cache owns one JSON file mapping `key -> {"Value": .., "Timestamp": ..}`.
//! Entries older than the instance TTL are dropped on load and lazily evicted
//! on read. Saves always go through a temporary file in the same directory
//! followed by an atomic rename, so a crash mid-write leaves the previous
//! file intact. Load and save failures are logged and absorbed; the cache
//! never takes the process down.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::errors::CacheError;

/// Time-to-live for one cache instance, built from day/hour/minute components.
///
/// The components are combined into a single span. When all of them are
/// absent or zero the cache falls back to 30 days.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TtlSpec {
    pub days: f64,
    pub hours: f64,
    pub minutes: f64,
}

impl TtlSpec {
    pub fn days(days: f64) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }

    pub fn hours(hours: f64) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    pub fn minutes(minutes: f64) -> Self {
        Self {
            minutes,
            ..Self::default()
        }
    }

    /// Resolve the configured components into a concrete span.
    pub fn as_delta(&self) -> TimeDelta {
        let seconds = self.days * 86_400.0 + self.hours * 3_600.0 + self.minutes * 60.0;
        if seconds <= 0.0 {
            return TimeDelta::days(30);
        }
        TimeDelta::milliseconds((seconds * 1_000.0) as i64)
    }
}

#[derive(Clone)]
struct StoredEntry {
    value: Value,
    stored_at: DateTime<Utc>,
}

/// On-disk row shape. The file stays readable by tools that know nothing
/// about TTL filtering; expiry is applied on load, not at rest.
#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    #[serde(rename = "Value")]
    value: Value,
    #[serde(rename = "Timestamp")]
    timestamp: DateTime<Utc>,
}

/// Thread-safe TTL cache persisted as a single JSON file.
pub struct DurableTtlCache {
    name: String,
    path: PathBuf,
    ttl: TtlSpec,
    autosave_interval: Duration,
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl DurableTtlCache {
    /// Open a cache backed by `path`, loading any previously persisted rows.
    pub async fn open(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        ttl: TtlSpec,
        autosave_interval: Duration,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            name: name.into(),
            path: path.into(),
            ttl,
            autosave_interval,
            entries: Mutex::new(HashMap::new()),
        });
        cache.load().await;
        cache
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the backing file, dropping rows older than the TTL.
    ///
    /// A missing file is created empty; an unreadable or corrupt file is
    /// logged and treated as empty.
    pub async fn load(&self) {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }

        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Err(err) = tokio::fs::write(&self.path, "{}").await {
                    warn!(cache = %self.name, error = %err, "Failed to initialize cache file");
                }
                return;
            }
            Err(err) => {
                warn!(
                    cache = %self.name,
                    error = %CacheError::LoadFailed {
                        name: self.name.clone(),
                        details: err.to_string(),
                    },
                    "Failed to read cache file, starting empty"
                );
                return;
            }
        };

        // Rows are decoded individually so one malformed entry does not
        // discard the rest of the file.
        let rows: HashMap<String, Value> = match serde_json::from_str(&raw) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    cache = %self.name,
                    error = %err,
                    "Cache file empty or corrupted, starting fresh"
                );
                return;
            }
        };

        let now = Utc::now();
        let ttl = self.ttl.as_delta();
        let mut loaded = 0usize;
        let mut expired = 0usize;
        let mut invalid = 0usize;

        let mut entries = self.entries.lock().expect("cache lock poisoned");
        for (key, row) in rows {
            let parsed: PersistedEntry = match serde_json::from_value(row) {
                Ok(parsed) => parsed,
                Err(_) => {
                    invalid += 1;
                    continue;
                }
            };
            if now - parsed.timestamp > ttl {
                expired += 1;
                continue;
            }
            entries.insert(
                key,
                StoredEntry {
                    value: parsed.value,
                    stored_at: parsed.timestamp,
                },
            );
            loaded += 1;
        }
        drop(entries);

        debug!(
            cache = %self.name,
            loaded, expired, invalid,
            "Loaded cache file"
        );
    }

    /// Upsert a value under the current timestamp. No I/O happens here.
    pub fn add(&self, key: &str, value: Value) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                stored_at: Utc::now(),
            },
        );
    }

    /// Fetch a value, evicting it under the same lock if it has expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).map(|(value, _)| value)
    }

    /// Fetch a value together with the time it was stored.
    pub fn get_entry(&self, key: &str) -> Option<(Value, DateTime<Utc>)> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if self.is_expired(entry.stored_at) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some((entry.value.clone(), entry.stored_at)),
            None => None,
        }
    }

    /// Cheap membership pre-check with the same eviction side effect as `get`.
    pub fn is_cached(&self, key: &str) -> bool {
        self.get_entry(key).is_some()
    }

    /// Remove a single key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired row. Returns how many rows were evicted.
    pub fn prune_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry.stored_at));
        before - entries.len()
    }

    /// Empty the cache and persist the empty state immediately.
    pub async fn clear(&self) {
        {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            entries.clear();
        }
        if let Err(err) = self.save().await {
            warn!(cache = %self.name, error = %err, "Failed to persist cleared cache");
        }
    }

    /// Serialize the current snapshot to disk.
    ///
    /// The snapshot is written to a temporary file in the destination
    /// directory, flushed to stable storage, then renamed over the target
    /// path. Readers only ever observe the old complete file or the new one.
    pub async fn save(&self) -> Result<(), CacheError> {
        let snapshot: Vec<(String, StoredEntry)> = {
            let entries = self.entries.lock().expect("cache lock poisoned");
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let mut rows: HashMap<String, PersistedEntry> = HashMap::with_capacity(snapshot.len());
        for (key, entry) in snapshot {
            rows.insert(
                key,
                PersistedEntry {
                    value: entry.value,
                    timestamp: entry.stored_at,
                },
            );
        }

        let serialized =
            serde_json::to_string_pretty(&rows).map_err(|source| CacheError::SerializeFailed {
                name: self.name.clone(),
                source,
            })?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "cache.json".to_string());
        let tmp_path = self.path.with_file_name(format!(
            ".{}.tmp-{}",
            file_name,
            uuid::Uuid::new_v4().simple()
        ));

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(serialized.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &self.path).await
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CacheError::SaveFailed {
                name: self.name.clone(),
                details: err.to_string(),
            });
        }

        trace!(cache = %self.name, rows = rows.len(), "Saved cache file");
        Ok(())
    }

    /// Persist on a fixed interval until cancelled, then flush once more so
    /// shutdown never loses the final in-memory state.
    pub async fn autosave_loop(&self, cancel: CancellationToken) {
        info!(cache = %self.name, interval = ?self.autosave_interval, "Autosave loop started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.autosave_interval) => {
                    if let Err(err) = self.save().await {
                        warn!(cache = %self.name, error = %err, "Autosave failed");
                    }
                }
                () = cancel.cancelled() => {
                    break;
                }
            }
        }
        if let Err(err) = self.save().await {
            warn!(cache = %self.name, error = %err, "Final autosave failed");
        }
        info!(cache = %self.name, "Autosave loop stopped");
    }

    fn is_expired(&self, stored_at: DateTime<Utc>) -> bool {
        Utc::now() - stored_at > self.ttl.as_delta()
    }

    #[cfg(test)]
    pub(crate) fn insert_with_timestamp(&self, key: &str, value: Value, stored_at: DateTime<Utc>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(key.to_string(), StoredEntry { value, stored_at });
    }
}
