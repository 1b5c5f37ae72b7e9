//! The task orchestrator: lifecycle, scheduling, and hot reload.
//!
//! Each managed task runs as its own loop: wait for its schedule window,
//! invoke the entry point, then wait out the cooldown or stop when the task
//! is one-shot. Every wait is a short poll against a cancellation token, so
//! stop and reload latency is bounded by the poll interval. A filesystem
//! watcher turns file modifications into dependency-ordered reloads of the
//! affected tasks.

use chrono::Local;
use notify::RecommendedWatcher;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::errors::TaskError;
use crate::tasks::descriptor::{TaskContext, TaskDescriptor};
use crate::tasks::loader::ModuleLoader;
use crate::tasks::watcher::spawn_fs_watcher;

/// How far a watched-file reload propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPolicy {
    /// Restart every task sharing a matched task's parent, so a shared
    /// dependency change restarts the whole group consistently.
    Cascade,
    /// Restart only the tasks whose watch set matched the changed file.
    Isolated,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Granularity of schedule/cooldown waits and cancellation latency.
    pub poll_interval: Duration,
    /// How long to wait for a run to stop before abandoning it.
    pub join_timeout: Duration,
    pub reload_policy: ReloadPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            join_timeout: Duration::from_secs(5),
            reload_policy: ReloadPolicy::Cascade,
        }
    }
}

struct ManagedTask {
    descriptor: TaskDescriptor,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct TaskTable {
    /// Registration order; reloads walk tasks in this order.
    order: Vec<String>,
    map: HashMap<String, ManagedTask>,
}

/// Owns the live task set and the watcher that hot-reloads it.
#[derive(Clone)]
pub struct TaskOrchestrator {
    tasks: Arc<Mutex<TaskTable>>,
    loader: Arc<dyn ModuleLoader>,
    tracker: TaskTracker,
    token: CancellationToken,
    watcher: Arc<std::sync::Mutex<Option<RecommendedWatcher>>>,
    settings: Arc<OrchestratorSettings>,
}

impl TaskOrchestrator {
    pub fn new(loader: Arc<dyn ModuleLoader>, settings: OrchestratorSettings) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(TaskTable::default())),
            loader,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            watcher: Arc::new(std::sync::Mutex::new(None)),
            settings: Arc::new(settings),
        }
    }

    /// Token cancelled by `stop_all`; the binary parks on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a task. Watched files are canonicalized where possible so
    /// watcher events resolve against them.
    pub async fn add_task(&self, mut descriptor: TaskDescriptor) -> Result<(), TaskError> {
        let mut watched = HashSet::new();
        for path in descriptor.watched_files.drain() {
            match tokio::fs::canonicalize(&path).await {
                Ok(resolved) => {
                    watched.insert(resolved);
                }
                Err(_) => {
                    watched.insert(path);
                }
            }
        }
        descriptor.watched_files = watched;

        let mut table = self.tasks.lock().await;
        if table.map.contains_key(&descriptor.name) {
            return Err(TaskError::DuplicateTask {
                name: descriptor.name.clone(),
            });
        }
        let name = descriptor.name.clone();
        table.order.push(name.clone());
        table.map.insert(
            name.clone(),
            ManagedTask {
                descriptor,
                cancel: self.token.child_token(),
                handle: None,
            },
        );
        info!(task = %name, "Task registered");
        Ok(())
    }

    /// Start one task's run loop. A no-op if it is already running.
    pub async fn start(&self, name: &str) -> Result<(), TaskError> {
        {
            let table = self.tasks.lock().await;
            let task = table.map.get(name).ok_or_else(|| TaskError::UnknownTask {
                name: name.to_string(),
            })?;
            if task
                .handle
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false)
            {
                debug!(task = %name, "Task already running");
                return Ok(());
            }
        }
        self.spawn_run_loop(name).await;
        Ok(())
    }

    pub async fn start_all(&self) {
        let names = {
            let table = self.tasks.lock().await;
            table.order.clone()
        };
        for name in names {
            if let Err(err) = self.start(&name).await {
                error!(task = %name, error = %err, "Failed to start task");
            }
        }
    }

    /// Stop one task cooperatively, joining its loop with a bounded timeout.
    pub async fn stop(&self, name: &str) -> Result<(), TaskError> {
        let handle = {
            let mut table = self.tasks.lock().await;
            let task = table
                .map
                .get_mut(name)
                .ok_or_else(|| TaskError::UnknownTask {
                    name: name.to_string(),
                })?;
            task.cancel.cancel();
            task.handle.take()
        };
        self.join_abandoning(name, handle).await;
        Ok(())
    }

    /// Cancel every task, join each with a timeout, stop the watcher, and
    /// wait for the tracker to drain. Always returns in bounded time.
    pub async fn stop_all(&self) {
        info!("Stopping all tasks");
        self.token.cancel();

        let handles: Vec<(String, Option<JoinHandle<()>>)> = {
            let mut table = self.tasks.lock().await;
            let names = table.order.clone();
            names
                .into_iter()
                .map(|name| {
                    let handle = table.map.get_mut(&name).and_then(|task| task.handle.take());
                    (name, handle)
                })
                .collect()
        };
        for (name, handle) in handles {
            self.join_abandoning(&name, handle).await;
        }

        self.stop_watcher();
        self.tracker.close();
        if tokio::time::timeout(self.settings.join_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Some background loops did not terminate before the timeout");
        }
        info!("All tasks stopped");
    }

    /// Clear transient task and watcher state while leaving caches (and the
    /// shutdown token) intact, so a fresh run can be assembled in-process.
    pub async fn reset_for_new_run(&self) {
        info!("Resetting task table for a new run");
        let handles: Vec<(String, Option<JoinHandle<()>>)> = {
            let mut table = self.tasks.lock().await;
            let drained: Vec<(String, Option<JoinHandle<()>>)> = table
                .order
                .clone()
                .into_iter()
                .map(|name| {
                    let handle = table.map.get_mut(&name).and_then(|task| {
                        task.cancel.cancel();
                        task.handle.take()
                    });
                    (name, handle)
                })
                .collect();
            table.order.clear();
            table.map.clear();
            drained
        };
        for (name, handle) in handles {
            self.join_abandoning(&name, handle).await;
        }
        self.stop_watcher();
    }

    /// Begin watching `roots` recursively. Modification events are resolved
    /// against every task's watch set; non-matching paths are no-ops.
    pub async fn start_watcher(&self, roots: &[PathBuf]) -> Result<(), crate::errors::WatcherError> {
        let (tx, mut rx) = mpsc::channel::<PathBuf>(256);
        let watcher = spawn_fs_watcher(roots, tx)?;
        {
            let mut slot = self.watcher.lock().expect("watcher lock poisoned");
            *slot = Some(watcher);
        }

        let orchestrator = self.clone();
        let token = self.token.clone();
        self.tracker.spawn(async move {
            info!("File watcher loop started");
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(path) => {
                                orchestrator.reload_path(&path).await;
                            }
                            None => break,
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
            info!("File watcher loop stopped");
        });

        info!(roots = ?roots, "File watcher started");
        Ok(())
    }

    /// React to one changed file: reload every task watching it, cascading
    /// to parent-sharing siblings under the cascade policy. Returns how many
    /// tasks were reloaded.
    pub async fn reload_path(&self, path: &Path) -> usize {
        let resolved = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());

        let affected: Vec<String> = {
            let table = self.tasks.lock().await;
            let matched: Vec<String> = table
                .order
                .iter()
                .filter(|name| {
                    table
                        .map
                        .get(*name)
                        .map(|task| {
                            task.descriptor.watched_files.contains(&resolved)
                                || task.descriptor.watched_files.contains(path)
                        })
                        .unwrap_or(false)
                })
                .cloned()
                .collect();

            if matched.is_empty() {
                Vec::new()
            } else {
                match self.settings.reload_policy {
                    ReloadPolicy::Isolated => matched,
                    ReloadPolicy::Cascade => {
                        let parents: HashSet<String> = matched
                            .iter()
                            .filter_map(|name| {
                                table
                                    .map
                                    .get(name)
                                    .and_then(|task| task.descriptor.parent.clone())
                            })
                            .collect();
                        table
                            .order
                            .iter()
                            .filter(|name| {
                                let shares_parent = table
                                    .map
                                    .get(*name)
                                    .and_then(|task| task.descriptor.parent.as_ref())
                                    .map(|parent| parents.contains(parent))
                                    .unwrap_or(false);
                                matched.contains(*name) || shares_parent
                            })
                            .cloned()
                            .collect()
                    }
                }
            }
        };

        if affected.is_empty() {
            trace!(path = %resolved.display(), "File change matched no task");
            return 0;
        }

        info!(path = %resolved.display(), tasks = ?affected, "Hot reload triggered");
        let mut refreshed: HashSet<String> = HashSet::new();
        for name in &affected {
            self.reload_task(name, &mut refreshed).await;
        }
        affected.len()
    }

    pub async fn task_names(&self) -> Vec<String> {
        self.tasks.lock().await.order.clone()
    }

    pub async fn descriptor(&self, name: &str) -> Option<TaskDescriptor> {
        let table = self.tasks.lock().await;
        table.map.get(name).map(|task| task.descriptor.clone())
    }

    pub async fn is_running(&self, name: &str) -> bool {
        let table = self.tasks.lock().await;
        table
            .map
            .get(name)
            .and_then(|task| task.handle.as_ref())
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop one task, refresh its dependencies and unit in declared order,
    /// swap in a freshly resolved entry point and re-derived schedule
    /// values, then start a new run. `refreshed` deduplicates unit refreshes
    /// across one reload pass so shared dependencies are refreshed once.
    async fn reload_task(&self, name: &str, refreshed: &mut HashSet<String>) {
        let (mut descriptor, handle) = {
            let mut table = self.tasks.lock().await;
            let task = match table.map.get_mut(name) {
                Some(task) => task,
                None => return,
            };
            task.cancel.cancel();
            (task.descriptor.clone(), task.handle.take())
        };
        self.join_abandoning(name, handle).await;

        for unit in &descriptor.module_dependencies {
            if refreshed.insert(unit.clone()) {
                if let Err(err) = self.loader.refresh(unit).await {
                    warn!(task = %name, unit = %unit, error = %err, "Dependency refresh failed");
                }
            }
        }
        if refreshed.insert(descriptor.unit.clone()) {
            if let Err(err) = self.loader.refresh(&descriptor.unit).await {
                warn!(task = %name, unit = %descriptor.unit, error = %err, "Unit refresh failed");
            }
        }

        match self.loader.resolve_entry(&descriptor.unit).await {
            Ok(entry) => descriptor.entry = entry,
            Err(err) => error!(
                task = %name,
                unit = %descriptor.unit,
                error = %err,
                "Entry re-resolution failed, keeping previous entry"
            ),
        }

        match self.loader.task_defaults(&descriptor.unit).await {
            Ok(Some(defaults)) => {
                if let Some(window) = defaults.schedule_window {
                    descriptor.schedule_window = Some(window);
                }
                if let Some(cooldown) = defaults.cooldown {
                    descriptor.cooldown = cooldown;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(task = %name, error = %err, "Failed to re-derive task defaults")
            }
        }

        {
            let mut table = self.tasks.lock().await;
            if let Some(task) = table.map.get_mut(name) {
                task.descriptor = descriptor;
            }
        }
        self.spawn_run_loop(name).await;
        info!(task = %name, "Task reloaded");
    }

    async fn spawn_run_loop(&self, name: &str) {
        let (descriptor, cancel) = {
            let mut table = self.tasks.lock().await;
            let task = match table.map.get_mut(name) {
                Some(task) => task,
                None => return,
            };
            task.cancel = self.token.child_token();
            (task.descriptor.clone(), task.cancel.clone())
        };

        let poll = self.settings.poll_interval;
        let task_name = name.to_string();
        let handle = self
            .tracker
            .spawn(run_task_loop(task_name.clone(), descriptor, cancel, poll));

        let mut table = self.tasks.lock().await;
        if let Some(task) = table.map.get_mut(&task_name) {
            task.handle = Some(handle);
        }
    }

    async fn join_abandoning(&self, name: &str, handle: Option<JoinHandle<()>>) {
        if let Some(handle) = handle {
            if tokio::time::timeout(self.settings.join_timeout, handle)
                .await
                .is_err()
            {
                warn!(task = %name, "Run did not stop before the join timeout, abandoning");
            }
        }
    }

    fn stop_watcher(&self) {
        let mut slot = self.watcher.lock().expect("watcher lock poisoned");
        if slot.take().is_some() {
            info!("File watcher stopped");
        }
    }
}

/// Sleep for `duration` unless the token fires first. Returns `false` when
/// cancelled.
async fn wait_interruptible(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

async fn run_task_loop(
    name: String,
    descriptor: TaskDescriptor,
    cancel: CancellationToken,
    poll: Duration,
) {
    info!(task = %name, "Task loop started");
    'run: loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Some(window) = descriptor.schedule_window {
            while !window.contains(Local::now().time()) {
                if !wait_interruptible(poll, &cancel).await {
                    break 'run;
                }
            }
        }

        let ctx = TaskContext {
            name: name.clone(),
            arguments: descriptor.arguments.clone(),
            cancel: cancel.clone(),
        };
        debug!(task = %name, "Entry point starting");
        match descriptor.entry.run(ctx).await {
            Ok(()) => debug!(task = %name, "Entry point returned"),
            // Entry failures are contained here so one task crash never
            // takes down the orchestrator.
            Err(err) => error!(task = %name, error = ?err, "Entry point failed"),
        }

        if descriptor.cooldown.is_zero() {
            break;
        }

        let deadline = tokio::time::Instant::now() + descriptor.cooldown;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let chunk = std::cmp::min(poll, deadline - now);
            if !wait_interruptible(chunk, &cancel).await {
                break 'run;
            }
        }
    }
    info!(task = %name, "Task loop stopped");
}
