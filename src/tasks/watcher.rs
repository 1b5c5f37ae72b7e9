//! Filesystem change watcher feeding the orchestrator's reload path.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::errors::WatcherError;

/// Watch `roots` recursively and forward modified/created file paths into
/// `events`. The returned watcher must be kept alive for events to flow.
pub fn spawn_fs_watcher(
    roots: &[PathBuf],
    events: mpsc::Sender<PathBuf>,
) -> Result<RecommendedWatcher, WatcherError> {
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    for path in event.paths {
                        if events.try_send(path).is_err() {
                            trace!("Watcher event channel full, dropping event");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "Filesystem watcher error");
            }
        },
        notify::Config::default(),
    )
    .map_err(|err| WatcherError::InitFailed {
        details: err.to_string(),
    })?;

    for root in roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| WatcherError::WatchPathFailed {
                path: root.clone(),
                details: err.to_string(),
            })?;
    }

    Ok(watcher)
}
