//! Engine composition root.
//!
//! The [`Engine`] owns every collaborator (store, registered model types,
//! authorization rules, lock table, job queue and executor) and hands them
//! by reference to the processor, the read facade and the scheduler.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use statecraft_auth::{AuthorizationExplanation, AuthorizationRules, Category, RuleArgs, Subject};
use statecraft_core::{Context, ModelId, Problem};
use statecraft_machine::{Command, ProcessingOptions};

use crate::config::EngineConfig;
use crate::jobs::{ExecutorStats, InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobResult, Job};
use crate::locks::ModelLocks;
use crate::processor::{CommandProcessor, CommandResult, Origin};
use crate::read::{ReadView, StoreReader};
use crate::registration::{ManagedModel, ModelRegistry};
use crate::scheduler::{self, SchedulerConfig, SchedulerHandle, Tick, TickReport};
use crate::store::{ModelStore, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model type '{0}' is registered more than once")]
    DuplicateModelType(String),

    #[error("store holds {stored} models but only {registered} belong to registered types")]
    UnregisteredModels { stored: usize, registered: usize },

    #[error("stored model {id} is invalid: {problem}")]
    InvalidModel { id: ModelId, problem: Problem },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to spawn background worker: {0}")]
    Spawn(#[from] std::io::Error),
}

type Executor = JobExecutor<Arc<InMemoryJobStore>>;

struct EngineCore<S> {
    store: S,
    registry: ModelRegistry,
    rules: AuthorizationRules,
    locks: ModelLocks,
    executor: Arc<Executor>,
    config: EngineConfig,
}

impl<S: ModelStore + 'static> EngineCore<S> {
    fn processor(&self) -> CommandProcessor<'_> {
        CommandProcessor {
            store: &self.store,
            registry: &self.registry,
            rules: &self.rules,
            locks: &self.locks,
            jobs: self.executor.store(),
            config: &self.config,
        }
    }
}

impl<S: ModelStore + 'static> Tick for EngineCore<S> {
    fn tick(&self, now: DateTime<Utc>) -> TickReport {
        scheduler::run_tick(&self.processor(), now)
    }
}

struct Workers {
    scheduler: SchedulerHandle,
    executor: JobExecutorHandle,
}

pub struct EngineBuilder<S> {
    store: S,
    models: Vec<Box<dyn ManagedModel>>,
    rules: AuthorizationRules,
    config: EngineConfig,
    executor: Executor,
}

impl<S: ModelStore + 'static> EngineBuilder<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            models: Vec::new(),
            rules: AuthorizationRules::default(),
            config: EngineConfig::default(),
            executor: JobExecutor::new(InMemoryJobStore::arc()),
        }
    }

    /// Register a model type (usually `ModelRegistration::new(machine)`).
    pub fn model<M: ManagedModel + 'static>(mut self, model: M) -> Self {
        self.models.push(Box::new(model));
        self
    }

    pub fn authorization(mut self, rules: AuthorizationRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Handle jobs whose kind matches `pattern` (`kind`, `prefix.*` or `*`).
    pub fn job_handler<F>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.executor.register_handler(pattern, handler);
        self
    }

    pub fn build(self) -> Result<Engine<S>, EngineError> {
        let mut registry = ModelRegistry::default();
        for model in self.models {
            let model_type = model.model_type();
            if !registry.insert(model) {
                return Err(EngineError::DuplicateModelType(model_type.to_string()));
            }
        }

        Ok(Engine {
            core: Arc::new(EngineCore {
                store: self.store,
                registry,
                rules: self.rules,
                locks: ModelLocks::new(),
                executor: Arc::new(self.executor),
                config: self.config,
            }),
            workers: Mutex::new(None),
        })
    }
}

/// A running state-machine engine over store `S`.
pub struct Engine<S: ModelStore + 'static> {
    core: Arc<EngineCore<S>>,
    workers: Mutex<Option<Workers>>,
}

impl<S: ModelStore + 'static> Engine<S> {
    pub fn builder(store: S) -> EngineBuilder<S> {
        EngineBuilder::new(store)
    }

    /// Check the stored models against the registered types, then start
    /// the background workers if configured.
    pub fn start(&self) -> Result<(), EngineError> {
        let core = &self.core;
        let mut per_type = BTreeMap::new();
        let mut registered = 0;
        for registration in core.registry.iter() {
            let models = core.store.list_by_type(registration.model_type())?;
            for stored in &models {
                registration
                    .verify(stored)
                    .map_err(|problem| EngineError::InvalidModel { id: stored.id, problem })?;
            }
            registered += models.len();
            per_type.insert(registration.model_type(), models.len());
        }

        let stored = core.store.count()?;
        if stored != registered {
            return Err(EngineError::UnregisteredModels { stored, registered });
        }
        info!(models = stored, types = ?per_type, "store warm-up complete");

        if core.config.run_background_workers {
            self.spawn_workers()?;
        }
        Ok(())
    }

    fn spawn_workers(&self) -> Result<(), EngineError> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| std::io::Error::other("worker registry poisoned"))?;
        if workers.is_some() {
            return Ok(());
        }

        let config = &self.core.config;
        let scheduler = scheduler::spawn(
            Arc::clone(&self.core),
            SchedulerConfig {
                interval: config.scheduler_tick,
                ..SchedulerConfig::default()
            },
        )?;
        let executor = self.core.executor.spawn(
            JobExecutorConfig::default()
                .with_poll_interval(config.job_poll_interval)
                .with_completed_retention(Some(config.completed_job_retention)),
        )?;
        *workers = Some(Workers { scheduler, executor });
        info!("background workers started");
        Ok(())
    }

    /// Stop the background workers, if running. Idempotent.
    pub fn shutdown(&self) {
        let workers = match self.workers.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(workers) = workers {
            workers.scheduler.shutdown();
            workers.executor.shutdown();
            info!("background workers stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_ok_and(|w| w.is_some())
    }

    /// Process one command. See [`CommandProcessor`].
    pub fn submit(&self, command: &Command, context: &Context, options: ProcessingOptions) -> CommandResult {
        self.core.processor().handle(command, context, options, Origin::External)
    }

    /// Run `f` against an authorized read view for `context`.
    pub fn read<T>(&self, context: &Context, f: impl FnOnce(&ReadView<'_>) -> T) -> T {
        let core = &self.core;
        let view = ReadView::new(context, &core.store, &core.registry, &core.rules);
        f(&view)
    }

    /// Full vote record of the command rules for `command` under `context`.
    pub fn explain(&self, command: &Command, context: &Context) -> AuthorizationExplanation {
        let reader = StoreReader(&self.core.store);
        let args = RuleArgs {
            context,
            subject: Subject::Command(command),
            reader: &reader,
        };
        self.core.rules.explain(Category::Commands, &args)
    }

    pub fn models_count(&self) -> Result<usize, Problem> {
        Ok(self.core.store.count()?)
    }

    /// Fire every time trigger due at `now` on the calling thread.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.core.tick(now)
    }

    /// Run every ready job on the calling thread.
    pub fn run_pending_jobs(&self) -> usize {
        self.core.executor.run_pending()
    }

    /// Drop completed jobs older than `retention`. The background executor
    /// does this on its own with `EngineConfig::completed_job_retention`.
    pub fn purge_completed_jobs(&self, retention: std::time::Duration) -> usize {
        self.core.executor.purge_completed(retention)
    }

    pub fn job_store(&self) -> &Arc<InMemoryJobStore> {
        self.core.executor.store()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.core.executor.stats()
    }

    pub fn store(&self) -> &S {
        &self.core.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Registered model type names, sorted.
    pub fn model_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.core.registry.iter().map(|m| m.model_type()).collect();
        types.sort_unstable();
        types
    }
}

impl<S: ModelStore + 'static> Drop for Engine<S> {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("engine dropped while background workers were running; stopping them");
            self.shutdown();
        }
    }
}
