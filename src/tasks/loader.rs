//! Reloadable unit registry.
//!
//! Entry points live behind named units. Resolving a unit re-runs its
//! registered factory, so a refresh picks up anything the factory re-reads
//! (configuration files, derived schedule values) without touching the
//! task's identity. Tests substitute their own `ModuleLoader` to observe
//! refresh ordering.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::TaskError;
use crate::tasks::descriptor::{TaskDefaults, TaskEntry};

/// Source of reloadable behavior for the orchestrator's reload path.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Refresh one unit's backing state before entries are re-resolved.
    async fn refresh(&self, unit: &str) -> anyhow::Result<()>;

    /// Produce a fresh entry point from the (possibly refreshed) unit.
    async fn resolve_entry(&self, unit: &str) -> anyhow::Result<Arc<dyn TaskEntry>>;

    /// Schedule values the unit derives from its own sources, if any.
    async fn task_defaults(&self, unit: &str) -> anyhow::Result<Option<TaskDefaults>>;
}

type EntryFactory = Box<dyn Fn() -> Arc<dyn TaskEntry> + Send + Sync>;
type DefaultsFactory = Box<dyn Fn() -> TaskDefaults + Send + Sync>;

struct UnitRegistration {
    entry: EntryFactory,
    defaults: Option<DefaultsFactory>,
}

/// In-process `ModuleLoader` backed by registered factories.
#[derive(Default)]
pub struct RegistryLoader {
    units: RwLock<HashMap<String, UnitRegistration>>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit whose entry point is rebuilt by `factory` on every
    /// resolution.
    pub fn register<F>(&self, unit: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn TaskEntry> + Send + Sync + 'static,
    {
        let mut units = self.units.write().expect("loader lock poisoned");
        units.insert(
            unit.into(),
            UnitRegistration {
                entry: Box::new(factory),
                defaults: None,
            },
        );
    }

    /// Register a unit together with a defaults factory re-evaluated on
    /// every reload.
    pub fn register_with_defaults<F, D>(&self, unit: impl Into<String>, factory: F, defaults: D)
    where
        F: Fn() -> Arc<dyn TaskEntry> + Send + Sync + 'static,
        D: Fn() -> TaskDefaults + Send + Sync + 'static,
    {
        let mut units = self.units.write().expect("loader lock poisoned");
        units.insert(
            unit.into(),
            UnitRegistration {
                entry: Box::new(factory),
                defaults: Some(Box::new(defaults)),
            },
        );
    }
}

#[async_trait]
impl ModuleLoader for RegistryLoader {
    async fn refresh(&self, unit: &str) -> anyhow::Result<()> {
        let units = self.units.read().expect("loader lock poisoned");
        if units.contains_key(unit) {
            Ok(())
        } else {
            Err(TaskError::UnknownUnit {
                unit: unit.to_string(),
            }
            .into())
        }
    }

    async fn resolve_entry(&self, unit: &str) -> anyhow::Result<Arc<dyn TaskEntry>> {
        let units = self.units.read().expect("loader lock poisoned");
        let registration = units.get(unit).ok_or_else(|| TaskError::UnknownUnit {
            unit: unit.to_string(),
        })?;
        Ok((registration.entry)())
    }

    async fn task_defaults(&self, unit: &str) -> anyhow::Result<Option<TaskDefaults>> {
        let units = self.units.read().expect("loader lock poisoned");
        let registration = units.get(unit).ok_or_else(|| TaskError::UnknownUnit {
            unit: unit.to_string(),
        })?;
        Ok(registration.defaults.as_ref().map(|factory| factory()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::descriptor::TaskContext;
    use std::time::Duration;

    struct NoopEntry;

    #[async_trait]
    impl TaskEntry for NoopEntry {
        async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolve_runs_factory_each_time() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let loader = RegistryLoader::new();
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        loader.register("unit::noop", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(NoopEntry) as Arc<dyn TaskEntry>
        });

        loader.resolve_entry("unit::noop").await.unwrap();
        loader.resolve_entry("unit::noop").await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_unit_is_an_error() {
        let loader = RegistryLoader::new();
        assert!(loader.refresh("missing").await.is_err());
        assert!(loader.resolve_entry("missing").await.is_err());
    }

    #[tokio::test]
    async fn defaults_factory_is_reevaluated() {
        let loader = RegistryLoader::new();
        loader.register_with_defaults(
            "unit::windowed",
            || Arc::new(NoopEntry) as Arc<dyn TaskEntry>,
            || TaskDefaults {
                schedule_window: None,
                cooldown: Some(Duration::from_secs(60)),
            },
        );

        let defaults = loader
            .task_defaults("unit::windowed")
            .await
            .unwrap()
            .expect("defaults registered");
        assert_eq!(defaults.cooldown, Some(Duration::from_secs(60)));

        let none = loader.task_defaults("unit::windowed").await.unwrap();
        assert!(none.is_some());
    }
}
