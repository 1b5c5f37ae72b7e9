//! Task identity and run contract.

use async_trait::async_trait;
use chrono::NaiveTime;
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::ConfigError;

/// Daily time window inside which a task is allowed to run.
///
/// Windows with `end` before `start` wrap across midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduleWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether `at` falls inside the window.
    pub fn contains(&self, at: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= at && at < self.end
        } else {
            at >= self.start || at < self.end
        }
    }
}

impl TryFrom<String> for ScheduleWindow {
    type Error = ConfigError;

    /// Parse a `HH:MM-HH:MM` window description.
    fn try_from(value: String) -> Result<Self, Self::Error> {
        let invalid = |details: &str| ConfigError::InvalidScheduleWindow {
            value: value.clone(),
            details: details.to_string(),
        };

        let (start_raw, end_raw) = value
            .split_once('-')
            .ok_or_else(|| invalid("expected HH:MM-HH:MM"))?;
        let start = NaiveTime::parse_from_str(start_raw.trim(), "%H:%M")
            .map_err(|err| invalid(&err.to_string()))?;
        let end = NaiveTime::parse_from_str(end_raw.trim(), "%H:%M")
            .map_err(|err| invalid(&err.to_string()))?;
        if start == end {
            return Err(invalid("window start and end are equal"));
        }
        Ok(Self { start, end })
    }
}

/// Per-run context handed to a task entry point.
#[derive(Clone)]
pub struct TaskContext {
    /// The registered task name.
    pub name: String,
    /// Opaque configuration bag passed unchanged on every run.
    pub arguments: Value,
    /// Cooperative cancellation signal for this run.
    pub cancel: CancellationToken,
}

/// Replaceable behavior of one managed task.
///
/// Entry points are held behind `Arc<dyn TaskEntry>` so a hot reload can swap
/// the behavior without disturbing the task's identity or configuration.
#[async_trait]
pub trait TaskEntry: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;
}

/// Schedule values a reloadable unit can re-derive after a reload, so a
/// source change can alter scheduling without a manual restart.
#[derive(Debug, Clone, Default)]
pub struct TaskDefaults {
    pub schedule_window: Option<ScheduleWindow>,
    pub cooldown: Option<Duration>,
}

/// Identity and run contract for one managed background task.
#[derive(Clone)]
pub struct TaskDescriptor {
    /// Unique key in the orchestrator's live task set.
    pub name: String,
    /// Current entry point; swapped by the reload path.
    pub entry: Arc<dyn TaskEntry>,
    /// Opaque configuration bag passed to the entry point each run.
    pub arguments: Value,
    /// Optional daily window; absent means always runnable.
    pub schedule_window: Option<ScheduleWindow>,
    /// Wait between successive runs. Zero makes the task one-shot.
    pub cooldown: Duration,
    /// Source files whose modification triggers a reload of this task.
    pub watched_files: HashSet<PathBuf>,
    /// Reloadable units refreshed, in order, before the task's own unit.
    pub module_dependencies: Vec<String>,
    /// The reloadable unit that owns this task's entry point.
    pub unit: String,
    /// Optional group key; a reload cascades to tasks sharing it.
    pub parent: Option<String>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, entry: Arc<dyn TaskEntry>) -> Self {
        Self {
            name: name.into(),
            entry,
            arguments: Value::Null,
            schedule_window: None,
            cooldown: Duration::ZERO,
            watched_files: HashSet::new(),
            module_dependencies: Vec::new(),
            unit: unit.into(),
            parent: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_schedule_window(mut self, window: ScheduleWindow) -> Self {
        self.schedule_window = Some(window);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_watched_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.watched_files.insert(path.into());
        self
    }

    pub fn with_module_dependencies(mut self, units: Vec<String>) -> Self {
        self.module_dependencies = units;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}
