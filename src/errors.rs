use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-overseer-config-1 Invalid number in {var_name}: {value}")]
    InvalidNumber { var_name: String, value: String },

    #[error("error-overseer-config-2 Invalid schedule window: {value}: {details}")]
    InvalidScheduleWindow { value: String, details: String },

    #[error("error-overseer-config-3 Worker count must be greater than 0: {var_name}")]
    WorkerCountZero { var_name: String },

    #[error("error-overseer-config-4 Invalid boolean in {var_name}: {value}")]
    InvalidBoolean { var_name: String, value: String },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("error-overseer-cache-1 Cache load failed: {name}: {details}")]
    LoadFailed { name: String, details: String },

    #[error("error-overseer-cache-2 Cache save failed: {name}: {details}")]
    SaveFailed { name: String, details: String },

    #[error("error-overseer-cache-3 Cache serialization failed: {name}: {source}")]
    SerializeFailed {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("error-overseer-queue-1 Queue capacity exceeded: {capacity}")]
    CapacityExceeded { capacity: usize },

    #[error("error-overseer-queue-2 Queue closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("error-overseer-task-1 Task already registered: {name}")]
    DuplicateTask { name: String },

    #[error("error-overseer-task-2 Task not registered: {name}")]
    UnknownTask { name: String },

    #[error("error-overseer-task-3 Reloadable unit not registered: {unit}")]
    UnknownUnit { unit: String },
}

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("error-overseer-watcher-1 Watcher initialization failed: {details}")]
    InitFailed { details: String },

    #[error("error-overseer-watcher-2 Failed to watch path: {path}: {details}")]
    WatchPathFailed { path: PathBuf, details: String },
}
