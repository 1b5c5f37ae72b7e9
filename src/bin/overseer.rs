use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use overseer::config::Config;
use overseer::storage::{CacheJanitorEntry, Caches, MAINTENANCE_UNIT};
use overseer::tasks::{
    OrchestratorSettings, RegistryLoader, TaskDefaults, TaskDescriptor, TaskEntry,
    TaskOrchestrator,
};

#[derive(Parser)]
#[command(name = "overseer", version, about = "Background task orchestration runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator with the cache maintenance tasks (default).
    Run,
    /// Empty every cache and persist the empty state.
    ClearCaches,
    /// Remove the checkpoint and evaluated cache files so the next run
    /// starts from the beginning of the subject list.
    ResetCheckpoint,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::new()?;
    info!(version = Config::version(), "Starting overseer");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ClearCaches => clear_caches(config).await,
        Command::ResetCheckpoint => reset_checkpoint(config).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "overseer=info".into()),
    );

    let fmt_layer = if std::env::var("JSON_LOGS").is_ok() {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().pretty().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    let caches = Caches::open(&config.cache_dir, config.autosave_interval).await;

    let loader = Arc::new(RegistryLoader::new());
    {
        let janitor_caches = caches.clone();
        let window = config.schedule_window;
        let cooldown = config.sweep_cooldown;
        loader.register_with_defaults(
            MAINTENANCE_UNIT,
            move || Arc::new(CacheJanitorEntry::new(janitor_caches.clone())) as Arc<dyn TaskEntry>,
            move || TaskDefaults {
                schedule_window: window,
                cooldown: Some(cooldown),
            },
        );
    }

    let orchestrator = TaskOrchestrator::new(
        loader.clone(),
        OrchestratorSettings {
            poll_interval: config.poll_interval,
            join_timeout: config.join_timeout,
            reload_policy: config.reload_policy,
        },
    );

    for descriptor in caches.autosave_descriptors() {
        orchestrator.add_task(descriptor).await?;
    }

    let mut janitor = TaskDescriptor::new(
        "cache-janitor",
        MAINTENANCE_UNIT,
        Arc::new(CacheJanitorEntry::new(caches.clone())),
    )
    .with_cooldown(config.sweep_cooldown);
    if let Some(window) = config.schedule_window {
        janitor = janitor.with_schedule_window(window);
    }
    orchestrator.add_task(janitor).await?;

    orchestrator.start_all().await;

    if let Some(root) = config.watch_root.clone() {
        if let Err(err) = orchestrator.start_watcher(&[root]).await {
            warn!(error = %err, "File watcher unavailable, hot reload disabled");
        }
    }

    wait_for_signal().await;
    info!("Shutdown signal received");

    orchestrator.stop_all().await;
    caches.save_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

async fn clear_caches(config: Config) -> anyhow::Result<()> {
    let caches = Caches::open(&config.cache_dir, config.autosave_interval).await;
    caches.clear_all().await;
    info!(dir = %config.cache_dir.display(), "All caches cleared");
    Ok(())
}

async fn reset_checkpoint(config: Config) -> anyhow::Result<()> {
    for file in ["checkpoint.json", "evaluated.json"] {
        let path: PathBuf = config.cache_dir.join(file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(file = %path.display(), "Removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(file = %path.display(), "Not present, nothing to remove")
            }
            Err(err) => warn!(file = %path.display(), error = %err, "Failed to remove"),
        }
    }
    Ok(())
}
