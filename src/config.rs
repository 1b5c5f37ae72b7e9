//! Environment-driven runtime configuration.
//!
//! Everything is read from environment variables with validated parsers and
//! sensible defaults, so the binary runs with no flags in development and is
//! fully configurable in deployment.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::tasks::{ReloadPolicy, ScheduleWindow};

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone)]
pub struct Config {
    /// Directory holding every persisted cache file.
    pub cache_dir: PathBuf,
    /// Interval between autosaves of each cache.
    pub autosave_interval: Duration,
    /// Granularity of every cancellable wait in the runtime.
    pub poll_interval: Duration,
    /// Bounded join wait applied when stopping tasks and workers.
    pub join_timeout: Duration,
    pub fetch_workers: usize,
    pub analysis_workers: usize,
    /// Bound on simultaneous outbound calls, independent of worker count.
    pub fetch_concurrency: usize,
    /// Checkpoint stride of the pipeline's position tracking.
    pub checkpoint_every: usize,
    /// Optional daily window constraining the sweep/janitor tasks.
    pub schedule_window: Option<ScheduleWindow>,
    /// Cooldown between successive sweep runs.
    pub sweep_cooldown: Duration,
    /// Optional directory watched recursively for hot reload.
    pub watch_root: Option<PathBuf>,
    pub reload_policy: ReloadPolicy,
}

impl Config {
    pub fn new() -> Result<Self> {
        Ok(Self {
            cache_dir: PathBuf::from(optional_env("CACHE_DIR").unwrap_or_else(|| "cache".into())),
            autosave_interval: Duration::from_secs(parse_u64("AUTOSAVE_INTERVAL_SECONDS", 60)?),
            poll_interval: Duration::from_millis(parse_u64("POLL_INTERVAL_MS", 500)?),
            join_timeout: Duration::from_secs(parse_u64("JOIN_TIMEOUT_SECONDS", 5)?),
            fetch_workers: parse_worker_count("FETCH_WORKERS", 4)?,
            analysis_workers: parse_worker_count("ANALYSIS_WORKERS", 4)?,
            fetch_concurrency: parse_worker_count("FETCH_CONCURRENCY", 4)?,
            checkpoint_every: parse_worker_count("CHECKPOINT_EVERY", 5)?,
            schedule_window: optional_env("SCHEDULE_WINDOW")
                .map(ScheduleWindow::try_from)
                .transpose()?,
            sweep_cooldown: Duration::from_secs(parse_u64("SWEEP_COOLDOWN_SECONDS", 300)?),
            watch_root: optional_env("WATCH_ROOT").map(PathBuf::from),
            reload_policy: if parse_bool("RELOAD_CASCADE", true)? {
                ReloadPolicy::Cascade
            } else {
                ReloadPolicy::Isolated
            },
        })
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

fn optional_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn parse_u64(var_name: &str, default: u64) -> Result<u64> {
    match optional_env(var_name) {
        None => Ok(default),
        Some(value) => value.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
            var_name: var_name.to_string(),
            value,
        }),
    }
}

fn parse_worker_count(var_name: &str, default: usize) -> Result<usize> {
    let value = parse_u64(var_name, default as u64)? as usize;
    if value == 0 {
        return Err(ConfigError::WorkerCountZero {
            var_name: var_name.to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(var_name: &str, default: bool) -> Result<bool> {
    match optional_env(var_name) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBoolean {
                var_name: var_name.to_string(),
                value,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var mutation is process-global, so these tests go through the
    // parser helpers with explicit values instead of setting variables.

    #[test]
    fn parse_helpers_accept_defaults() {
        assert_eq!(parse_u64("OVERSEER_TEST_UNSET_U64", 42).unwrap(), 42);
        assert_eq!(parse_worker_count("OVERSEER_TEST_UNSET_WC", 3).unwrap(), 3);
        assert!(parse_bool("OVERSEER_TEST_UNSET_BOOL", true).unwrap());
    }

    #[test]
    fn window_env_parses_like_the_value_type() {
        let window = ScheduleWindow::try_from("09:00-17:00".to_string()).unwrap();
        assert!(window.contains(chrono::NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn config_builds_from_the_current_environment() {
        let config = Config::new().unwrap();
        assert!(config.fetch_workers >= 1);
        assert!(config.poll_interval > Duration::ZERO);
    }
}
