//! Scheduling, cancellation, and hot-reload behavior of the orchestrator.

use async_trait::async_trait;
use chrono::Local;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use overseer::tasks::{
    ModuleLoader, OrchestratorSettings, ReloadPolicy, ScheduleWindow, TaskContext, TaskDefaults,
    TaskDescriptor, TaskEntry, TaskOrchestrator,
};

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        poll_interval: Duration::from_millis(20),
        join_timeout: Duration::from_secs(1),
        reload_policy: ReloadPolicy::Cascade,
    }
}

/// Entry that counts its runs and returns immediately.
struct CountingEntry {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskEntry for CountingEntry {
    async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Entry that parks until its run is cancelled.
struct ParkingEntry;

#[async_trait]
impl TaskEntry for ParkingEntry {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        ctx.cancel.cancelled().await;
        Ok(())
    }
}

/// Entry that ignores cancellation entirely.
struct StubbornEntry;

#[async_trait]
impl TaskEntry for StubbornEntry {
    async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Entry that always fails; the orchestrator must absorb it.
struct FailingEntry {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskEntry for FailingEntry {
    async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("synthetic entry failure")
    }
}

/// Loader double recording refresh/resolve order and handing out counting
/// entries whose counters aggregate across reloads.
#[derive(Default)]
struct RecordingLoader {
    events: Mutex<Vec<String>>,
    defaults: Mutex<HashMap<String, TaskDefaults>>,
    counters: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl RecordingLoader {
    fn counter_for(&self, unit: &str) -> Arc<AtomicUsize> {
        self.counters
            .lock()
            .unwrap()
            .entry(unit.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    fn set_defaults(&self, unit: &str, defaults: TaskDefaults) {
        self.defaults
            .lock()
            .unwrap()
            .insert(unit.to_string(), defaults);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleLoader for RecordingLoader {
    async fn refresh(&self, unit: &str) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("refresh:{unit}"));
        Ok(())
    }

    async fn resolve_entry(&self, unit: &str) -> anyhow::Result<Arc<dyn TaskEntry>> {
        self.events.lock().unwrap().push(format!("resolve:{unit}"));
        Ok(Arc::new(CountingEntry {
            runs: self.counter_for(unit),
        }))
    }

    async fn task_defaults(&self, unit: &str) -> anyhow::Result<Option<TaskDefaults>> {
        Ok(self.defaults.lock().unwrap().get(unit).cloned())
    }
}

async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn counting_task(name: &str, unit: &str, loader: &RecordingLoader) -> (TaskDescriptor, Arc<AtomicUsize>) {
    let runs = loader.counter_for(unit);
    let descriptor = TaskDescriptor::new(
        name,
        unit,
        Arc::new(CountingEntry { runs: runs.clone() }),
    );
    (descriptor, runs)
}

async fn wait_until_stopped(
    orchestrator: &TaskOrchestrator,
    name: &str,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !orchestrator.is_running(name).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    !orchestrator.is_running(name).await
}

#[tokio::test]
async fn one_shot_task_runs_exactly_once() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let (descriptor, runs) = counting_task("once", "unit::once", &loader);
    orchestrator.add_task(descriptor).await.unwrap();
    orchestrator.start("once").await.unwrap();

    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);
    assert!(wait_until_stopped(&orchestrator, "once", Duration::from_secs(2)).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cooldown_task_reruns_after_the_cooldown() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let (descriptor, runs) = counting_task("steady", "unit::steady", &loader);
    orchestrator
        .add_task(descriptor.with_cooldown(Duration::from_millis(150)))
        .await
        .unwrap();
    orchestrator.start("steady").await.unwrap();

    assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 2, Duration::from_secs(3)).await);
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn entry_failure_is_absorbed_and_the_loop_continues() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let runs = Arc::new(AtomicUsize::new(0));
    let descriptor = TaskDescriptor::new(
        "flaky",
        "unit::flaky",
        Arc::new(FailingEntry { runs: runs.clone() }),
    )
    .with_cooldown(Duration::from_millis(50));
    orchestrator.add_task(descriptor).await.unwrap();
    orchestrator.start("flaky").await.unwrap();

    // The loop survives repeated failures and keeps rerunning.
    assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 3, Duration::from_secs(3)).await);
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn closed_schedule_window_blocks_the_entry_point() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    // A window starting two hours from now never contains the present.
    let now = Local::now().time();
    let window = ScheduleWindow::new(
        now + chrono::Duration::hours(2),
        now + chrono::Duration::hours(3),
    );

    let (descriptor, runs) = counting_task("after-hours", "unit::after-hours", &loader);
    orchestrator
        .add_task(descriptor.with_schedule_window(window))
        .await
        .unwrap();
    orchestrator.start("after-hours").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(orchestrator.is_running("after-hours").await);

    orchestrator.stop_all().await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn open_schedule_window_allows_the_entry_point() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let now = Local::now().time();
    let window = ScheduleWindow::new(
        now - chrono::Duration::hours(1),
        now + chrono::Duration::hours(1),
    );

    let (descriptor, runs) = counting_task("in-hours", "unit::in-hours", &loader);
    orchestrator
        .add_task(descriptor.with_schedule_window(window))
        .await
        .unwrap();
    orchestrator.start("in-hours").await.unwrap();

    assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 1, Duration::from_secs(2)).await);
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn reload_refreshes_dependencies_in_declared_order() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("task.cfg");
    tokio::fs::write(&watched, "v1").await.unwrap();

    let (descriptor, _) = counting_task("ordered", "unit::own", &loader);
    orchestrator
        .add_task(
            descriptor
                .with_watched_file(&watched)
                .with_module_dependencies(vec!["unit::dep-a".to_string(), "unit::dep-b".to_string()]),
        )
        .await
        .unwrap();
    orchestrator.start("ordered").await.unwrap();

    let reloaded = orchestrator.reload_path(&watched).await;
    assert_eq!(reloaded, 1);

    let events = loader.events();
    assert_eq!(
        events,
        vec![
            "refresh:unit::dep-a".to_string(),
            "refresh:unit::dep-b".to_string(),
            "refresh:unit::own".to_string(),
            "resolve:unit::own".to_string(),
        ]
    );
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn shared_dependency_is_refreshed_once_per_pass() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("shared.cfg");
    tokio::fs::write(&watched, "v1").await.unwrap();

    for name in ["first", "second"] {
        let (descriptor, _) = counting_task(name, &format!("unit::{name}"), &loader);
        orchestrator
            .add_task(
                descriptor
                    .with_watched_file(&watched)
                    .with_module_dependencies(vec!["unit::shared".to_string()]),
            )
            .await
            .unwrap();
    }
    orchestrator.start_all().await;

    assert_eq!(orchestrator.reload_path(&watched).await, 2);

    let refreshes: Vec<String> = loader
        .events()
        .into_iter()
        .filter(|e| e == "refresh:unit::shared")
        .collect();
    assert_eq!(refreshes.len(), 1);
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn cascade_reload_restarts_tasks_sharing_a_parent() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("leaf.cfg");
    tokio::fs::write(&watched, "v1").await.unwrap();

    let (leaf, _) = counting_task("leaf", "unit::leaf", &loader);
    orchestrator
        .add_task(leaf.with_watched_file(&watched).with_parent("group"))
        .await
        .unwrap();

    let (sibling, _) = counting_task("sibling", "unit::sibling", &loader);
    orchestrator
        .add_task(sibling.with_parent("group"))
        .await
        .unwrap();

    let (outsider, _) = counting_task("outsider", "unit::outsider", &loader);
    orchestrator.add_task(outsider).await.unwrap();
    orchestrator.start_all().await;

    assert_eq!(orchestrator.reload_path(&watched).await, 2);

    let events = loader.events();
    assert!(events.contains(&"resolve:unit::leaf".to_string()));
    assert!(events.contains(&"resolve:unit::sibling".to_string()));
    assert!(!events.contains(&"resolve:unit::outsider".to_string()));
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn isolated_reload_restarts_only_matched_tasks() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(
        loader.clone(),
        OrchestratorSettings {
            reload_policy: ReloadPolicy::Isolated,
            ..settings()
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("leaf.cfg");
    tokio::fs::write(&watched, "v1").await.unwrap();

    let (leaf, _) = counting_task("leaf", "unit::leaf", &loader);
    orchestrator
        .add_task(leaf.with_watched_file(&watched).with_parent("group"))
        .await
        .unwrap();
    let (sibling, _) = counting_task("sibling", "unit::sibling", &loader);
    orchestrator
        .add_task(sibling.with_parent("group"))
        .await
        .unwrap();
    orchestrator.start_all().await;

    assert_eq!(orchestrator.reload_path(&watched).await, 1);
    assert!(!loader
        .events()
        .contains(&"resolve:unit::sibling".to_string()));
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn unmatched_path_is_a_no_op() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let (descriptor, _) = counting_task("task", "unit::task", &loader);
    orchestrator.add_task(descriptor).await.unwrap();
    orchestrator.start_all().await;

    assert_eq!(
        orchestrator
            .reload_path(std::path::Path::new("/nonexistent/other.cfg"))
            .await,
        0
    );
    assert!(loader.events().is_empty());
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn reload_interrupts_cooldown_and_restarts_immediately() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("slow.cfg");
    tokio::fs::write(&watched, "v1").await.unwrap();

    let runs = loader.counter_for("unit::slow");
    let descriptor = TaskDescriptor::new(
        "slow",
        "unit::slow",
        Arc::new(CountingEntry { runs: runs.clone() }),
    )
    .with_cooldown(Duration::from_secs(60))
    .with_watched_file(&watched);
    orchestrator.add_task(descriptor).await.unwrap();
    orchestrator.start("slow").await.unwrap();

    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    // The task is parked in its long cooldown; a reload must not wait it out.
    let start = Instant::now();
    orchestrator.reload_path(&watched).await;
    assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 2, Duration::from_secs(2)).await);
    assert!(start.elapsed() < Duration::from_secs(10));
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn reload_with_unchanged_defaults_is_idempotent() {
    let loader = Arc::new(RecordingLoader::default());
    let window = ScheduleWindow::try_from("09:00-17:00".to_string()).unwrap();
    loader.set_defaults(
        "unit::stable",
        TaskDefaults {
            schedule_window: Some(window),
            cooldown: Some(Duration::from_secs(60)),
        },
    );
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("stable.cfg");
    tokio::fs::write(&watched, "v1").await.unwrap();

    let (descriptor, _) = counting_task("stable", "unit::stable", &loader);
    orchestrator
        .add_task(
            descriptor
                .with_schedule_window(window)
                .with_cooldown(Duration::from_secs(60))
                .with_watched_file(&watched),
        )
        .await
        .unwrap();
    orchestrator.start("stable").await.unwrap();

    orchestrator.reload_path(&watched).await;

    let reloaded = orchestrator.descriptor("stable").await.unwrap();
    assert_eq!(reloaded.schedule_window, Some(window));
    assert_eq!(reloaded.cooldown, Duration::from_secs(60));
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn reload_rederives_schedule_values_from_the_unit() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("tuned.cfg");
    tokio::fs::write(&watched, "v1").await.unwrap();

    let (descriptor, _) = counting_task("tuned", "unit::tuned", &loader);
    orchestrator
        .add_task(
            descriptor
                .with_cooldown(Duration::from_secs(60))
                .with_watched_file(&watched),
        )
        .await
        .unwrap();
    orchestrator.start("tuned").await.unwrap();

    // The unit's sources now describe a different cooldown.
    loader.set_defaults(
        "unit::tuned",
        TaskDefaults {
            schedule_window: None,
            cooldown: Some(Duration::from_secs(5)),
        },
    );
    orchestrator.reload_path(&watched).await;

    let reloaded = orchestrator.descriptor("tuned").await.unwrap();
    assert_eq!(reloaded.cooldown, Duration::from_secs(5));
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn stop_all_terminates_cooperative_tasks_promptly() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    orchestrator
        .add_task(TaskDescriptor::new("parked", "unit::parked", Arc::new(ParkingEntry)))
        .await
        .unwrap();
    orchestrator.start("parked").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(orchestrator.is_running("parked").await);

    let start = Instant::now();
    orchestrator.stop_all().await;
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(!orchestrator.is_running("parked").await);
}

#[tokio::test]
async fn stop_all_abandons_tasks_that_ignore_cancellation() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(
        loader.clone(),
        OrchestratorSettings {
            join_timeout: Duration::from_millis(200),
            ..settings()
        },
    );

    orchestrator
        .add_task(TaskDescriptor::new(
            "stubborn",
            "unit::stubborn",
            Arc::new(StubbornEntry),
        ))
        .await
        .unwrap();
    orchestrator.start("stubborn").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    orchestrator.stop_all().await;
    // The stubborn run is abandoned, not joined.
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn duplicate_task_names_are_rejected() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let (first, _) = counting_task("dup", "unit::dup", &loader);
    orchestrator.add_task(first).await.unwrap();
    let (second, _) = counting_task("dup", "unit::dup", &loader);
    let err = orchestrator.add_task(second).await.unwrap_err();
    assert!(err.to_string().contains("already registered"));
}

#[tokio::test]
async fn reset_for_new_run_clears_tasks_but_not_shutdown() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let (descriptor, _) = counting_task("transient", "unit::transient", &loader);
    orchestrator
        .add_task(descriptor.with_cooldown(Duration::from_millis(50)))
        .await
        .unwrap();
    orchestrator.start_all().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    orchestrator.reset_for_new_run().await;
    assert!(orchestrator.task_names().await.is_empty());

    // The same name can be registered and run again.
    let (descriptor, runs) = counting_task("transient", "unit::transient", &loader);
    orchestrator.add_task(descriptor).await.unwrap();
    orchestrator.start("transient").await.unwrap();
    let before = runs.load(Ordering::SeqCst);
    assert!(wait_for(|| runs.load(Ordering::SeqCst) > before, Duration::from_secs(2)).await);
    orchestrator.stop_all().await;
}

#[tokio::test]
async fn watcher_reloads_a_task_when_its_file_changes() {
    let loader = Arc::new(RecordingLoader::default());
    let orchestrator = TaskOrchestrator::new(loader.clone(), settings());

    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("live.cfg");
    tokio::fs::write(&watched, "v1").await.unwrap();

    let runs = loader.counter_for("unit::live");
    let descriptor = TaskDescriptor::new(
        "live",
        "unit::live",
        Arc::new(CountingEntry { runs: runs.clone() }),
    )
    .with_cooldown(Duration::from_secs(60))
    .with_watched_file(&watched);
    orchestrator.add_task(descriptor).await.unwrap();
    orchestrator.start("live").await.unwrap();

    assert!(wait_for(|| runs.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    orchestrator
        .start_watcher(&[dir.path().to_path_buf()])
        .await
        .unwrap();
    // Give the platform watcher a moment to register.
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::fs::write(&watched, "v2").await.unwrap();

    // The touched file stops the in-flight cooldown and restarts the task.
    assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 2, Duration::from_secs(10)).await);
    orchestrator.stop_all().await;
}
