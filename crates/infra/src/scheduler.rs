//! Time-trigger scheduler.
//!
//! Every tick lists the models sitting in states with `at_time` triggers and
//! submits the internal event of each trigger that is due, with a `System`
//! context pinned to the tick time. A failed trigger is logged and picked up
//! again by the next tick, since the model is still in its timed state.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use statecraft_core::Context;
use statecraft_machine::ProcessingOptions;

use crate::processor::{CommandProcessor, Origin};
use crate::read::StoreReader;

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fired: usize,
    pub failed: usize,
}

/// Run every due time trigger once.
pub fn run_tick(processor: &CommandProcessor<'_>, now: DateTime<Utc>) -> TickReport {
    let mut report = TickReport::default();
    let reader = StoreReader(processor.store);

    for registration in processor.registry.iter() {
        let due = match registration.due_commands(&reader, now) {
            Ok(due) => due,
            Err(problem) => {
                warn!(model_type = registration.model_type(), %problem, "listing due time triggers failed");
                report.failed += 1;
                continue;
            }
        };

        for command in due {
            let context = Context::system().at(now);
            match processor.handle(&command, &context, ProcessingOptions::default(), Origin::Scheduler) {
                Ok(_) => {
                    info!(event = %command.event(), model = ?command.model(), "time trigger fired");
                    report.fired += 1;
                }
                Err(failure) => {
                    warn!(
                        event = %command.event(),
                        model = ?command.model(),
                        problem = %failure.problem,
                        "time trigger failed"
                    );
                    report.failed += 1;
                }
            }
        }
    }
    report
}

/// Anything the background scheduler thread can tick.
pub trait Tick: Send + Sync + 'static {
    fn tick(&self, now: DateTime<Utc>) -> TickReport;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            name: "statecraft-scheduler".to_string(),
        }
    }
}

/// Handle to a running scheduler thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop after the current tick and wait for the thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

pub fn spawn<T: Tick>(target: Arc<T>, config: SchedulerConfig) -> std::io::Result<SchedulerHandle> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let join = thread::Builder::new()
        .name(config.name.clone())
        .spawn(move || scheduler_loop(target.as_ref(), &config, &shutdown_rx))?;

    Ok(SchedulerHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

fn scheduler_loop<T: Tick>(target: &T, config: &SchedulerConfig, shutdown_rx: &mpsc::Receiver<()>) {
    info!(scheduler = %config.name, interval_ms = config.interval.as_millis() as u64, "scheduler started");
    loop {
        let report = target.tick(Utc::now());
        if report.fired + report.failed > 0 {
            info!(scheduler = %config.name, fired = report.fired, failed = report.failed, "scheduler tick");
        }
        match shutdown_rx.recv_timeout(config.interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(scheduler = %config.name, "scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::jobs::InMemoryJobStore;
    use crate::locks::ModelLocks;
    use crate::registration::{ModelRegistration, ModelRegistry};
    use crate::store::{InMemoryModelStore, ModelStore};
    use chrono::Duration as ChronoDuration;
    use serde::Deserialize;
    use statecraft_auth::AuthorizationRules;
    use statecraft_core::{ExpectedVersion, Model, ModelId, ModelProps};
    use statecraft_machine::{EventRef, StateMachine, TransitionSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Lease {
        holder: String,
    }

    impl ModelProps for Lease {
        const MODEL_TYPE: &'static str = "lease";
    }

    const ACTIVE: &str = "Active";
    const EXPIRE: EventRef = EventRef::instance("lease", "Expire").internal();

    fn registry() -> ModelRegistry {
        let machine = StateMachine::<Lease>::builder()
            .states(&[ACTIVE])
            .event(EXPIRE, |e| e)
            .state(ACTIVE, |s| {
                s.on_event(EXPIRE, TransitionSpec::delete())
                    .at_time(EXPIRE, |m| m.last_state_transition_at + ChronoDuration::hours(1))
            })
            .build()
            .unwrap();
        let mut registry = ModelRegistry::default();
        registry.insert(Box::new(ModelRegistration::new(machine)));
        registry
    }

    fn lease(store: &InMemoryModelStore, at: DateTime<Utc>) -> ModelId {
        let model = Model {
            id: ModelId::new(),
            state: ACTIVE.to_string(),
            props: Lease { holder: "ada".into() },
            created_at: at,
            last_state_transition_at: at,
            version: 1,
        };
        store.save(model.encode().unwrap(), ExpectedVersion::Absent).unwrap();
        model.id
    }

    #[test]
    fn fires_only_due_triggers_without_authorization() {
        let store = InMemoryModelStore::new();
        let registry = registry();
        // No rules at all: scheduler commands are not authorized.
        let rules = AuthorizationRules::default();
        let locks = ModelLocks::new();
        let jobs = InMemoryJobStore::new();
        let config = EngineConfig::default();
        let processor = CommandProcessor {
            store: &store,
            registry: &registry,
            rules: &rules,
            locks: &locks,
            jobs: &jobs,
            config: &config,
        };

        let t0 = Utc::now();
        let old = lease(&store, t0 - ChronoDuration::hours(2));
        let fresh = lease(&store, t0);

        let report = run_tick(&processor, t0);
        assert_eq!(report, TickReport { fired: 1, failed: 0 });
        assert_eq!(store.load(old).unwrap(), None);
        assert!(store.load(fresh).unwrap().is_some());

        let log = store.event_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].actor, "system");
        assert_eq!(log[0].time, t0);

        assert_eq!(run_tick(&processor, t0), TickReport::default());
        let later = run_tick(&processor, t0 + ChronoDuration::hours(1));
        assert_eq!(later.fired, 1);
        assert_eq!(store.count().unwrap(), 0);
    }

    struct Counter(AtomicUsize);

    impl Tick for Counter {
        fn tick(&self, _now: DateTime<Utc>) -> TickReport {
            self.0.fetch_add(1, Ordering::SeqCst);
            TickReport::default()
        }
    }

    #[test]
    fn background_thread_ticks_until_shutdown() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let handle = spawn(
            counter.clone(),
            SchedulerConfig {
                interval: Duration::from_millis(5),
                ..SchedulerConfig::default()
            },
        )
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        handle.shutdown();
        let ticks = counter.0.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected several ticks, got {ticks}");

        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.0.load(Ordering::SeqCst), ticks);
    }
}
