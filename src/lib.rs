//! # overseer
//!
//! overseer is a long-running process orchestrator. It runs a set of named,
//! independently schedulable background tasks, restarts them when their
//! source changes, and coordinates their access to shared durable TTL caches
//! while protecting rate-limited external resources from overload.
//!
//! ## Architecture Overview
//!
//! The runtime is built from four components, leaves first:
//!
//! ### Durable TTL Cache
//! - Thread-safe key/value store with a per-instance TTL
//! - Crash-safe JSON persistence (temp file + atomic rename)
//! - Lazy eviction on read; expired rows dropped on load
//!
//! ### Rate Limiter
//! - "Provider unavailable until T" records layered on a cache instance
//! - Cheap pre-checks plus cancellable waits for workers
//!
//! ### Work Pipeline
//! - Fetch workers bounded by a concurrency semaphore and the rate limiter
//! - Analysis workers running an injected evaluation strategy
//! - Sentinel-based shutdown and checkpointed resume
//!
//! ### Task Orchestrator
//! - Named tasks with daily schedule windows and inter-run cooldowns
//! - Cooperative cancellation with bounded joins
//! - Filesystem watcher driving dependency-ordered hot reload
//!
//! ## Configuration
//!
//! The runtime is configured via environment variables; see [`config`].
//!
//! ## Error Handling
//!
//! All error strings use the format:
//! `error-overseer-<domain>-<number> <message>: <details>`
//!
//! ## Example
//!
//! ```rust,ignore
//! use overseer::config::Config;
//! use overseer::storage::Caches;
//! use overseer::tasks::{OrchestratorSettings, RegistryLoader, TaskOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::new()?;
//!     let caches = Caches::open(&config.cache_dir, config.autosave_interval).await;
//!
//!     let loader = std::sync::Arc::new(RegistryLoader::new());
//!     // ... register reloadable units ...
//!
//!     let orchestrator = TaskOrchestrator::new(loader, OrchestratorSettings::default());
//!     for descriptor in caches.autosave_descriptors() {
//!         orchestrator.add_task(descriptor).await?;
//!     }
//!     orchestrator.start_all().await;
//!     // ... wait for shutdown signal ...
//!     orchestrator.stop_all().await;
//!     Ok(())
//! }
//! ```

/// Environment-driven configuration for all runtime components.
pub mod config;

pub(crate) mod errors;

/// Producer/consumer pipeline fanning fetch work into analysis workers.
///
/// The fetch and analysis sides are connected by bounded queues, scaled
/// independently, and terminated by per-worker sentinels. External calls are
/// gated by the rate limiter and a shared concurrency semaphore.
pub mod pipeline;

/// Work queue abstraction used between the pipeline stages.
pub mod queue;

/// Session validity gate workers park on when a collaborator's
/// authorization expires.
pub mod session;

/// Durable TTL caches and the shared cache set.
///
/// Provides the crash-safe persisted key/value store every task and worker
/// reads and writes, plus maintenance entries (autosave, janitor) that run
/// as orchestrator-managed tasks.
pub mod storage;

/// Background task orchestration: scheduling, cancellation, hot reload.
pub mod tasks;

/// Provider back-off records and cancellable rate-limit waits.
pub mod throttle;

pub use errors::{CacheError, ConfigError, QueueError, TaskError, WatcherError};
