//! Job executor with retry and backoff logic.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
    /// How long completed jobs stay queryable. `None` keeps them forever.
    pub completed_retention: Option<Duration>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "statecraft-jobs".to_string(),
            completed_retention: Some(Duration::from_secs(3600)),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_completed_retention(mut self, retention: Option<Duration>) -> Self {
        self.completed_retention = retention;
        self
    }
}

/// Handle to a running executor thread.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the current job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub uptime_secs: u64,
}

/// Runs queued jobs with registered handlers, retrying and dead-lettering per job policy.
///
/// Handlers are looked up by exact kind, then by `prefix.*` pattern, then `*`.
/// Job failures never reach the command that queued the job; they are logged
/// and retried.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
    stats: Mutex<ExecutorStats>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            stats: Mutex::new(ExecutorStats::default()),
        }
    }

    /// Register a handler for a job kind pattern (`kind`, `prefix.*` or `*`).
    pub fn register_handler<F>(&mut self, kind_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(kind_pattern.into(), Box::new(handler));
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn get_handler(&self, kind: &JobKind) -> Option<&JobHandler> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        // Longest matching prefix wins ("todo.bill.*" before "todo.*").
        let prefixed = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = type_name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);

        prefixed.or_else(|| self.handlers.get("*"))
    }

    /// Run every job that is ready right now, on the calling thread.
    ///
    /// Returns the number of attempts made. Jobs rescheduled with a backoff
    /// are left for a later call.
    pub fn run_pending(&self) -> usize {
        let mut attempts = 0;
        loop {
            match self.store.claim_next() {
                Ok(Some(mut job)) => {
                    attempts += 1;
                    self.run_claimed(&mut job);
                }
                Ok(None) => return attempts,
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    return attempts;
                }
            }
        }
    }

    /// Spawn a polling thread. The executor stays usable from other threads.
    pub fn spawn(self: &Arc<Self>, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let executor = Arc::clone(self);

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(&executor, &config, &shutdown_rx))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn run_claimed(&self, job: &mut Job) {
        debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "claimed job");
        let result = self.execute(job);

        if let Ok(mut s) = self.stats.lock() {
            s.jobs_processed += 1;
            match &result {
                Ok(()) => s.jobs_succeeded += 1,
                Err(_) => {
                    s.jobs_failed += 1;
                    if matches!(job.status, JobStatus::DeadLettered { .. }) {
                        s.jobs_dead_lettered += 1;
                    }
                }
            }
        }

        match result {
            Ok(()) => debug!(job_id = %job.id, "job completed"),
            Err(e) => debug!(job_id = %job.id, error = %e, status = ?job.status, "job execution failed"),
        }
    }

    /// Run a claimed job's handler and persist the outcome.
    fn execute(&self, job: &mut Job) -> Result<(), String> {
        let started = Utc::now();

        let outcome = match self.get_handler(&job.kind) {
            Some(handler) => handler(job),
            None => JobResult::Failure(format!("no handler for job kind: {}", job.kind)),
        };

        match outcome {
            JobResult::Success => {
                job.mark_completed(started);
                self.store.update(job).map_err(|e| e.to_string())?;
                Ok(())
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), started);
                self.persist_failure(job, &error)?;
                Err(error)
            }
            JobResult::RetryNow => {
                let reason = "retry requested".to_string();
                job.mark_failed(reason.clone(), started);
                job.scheduled_at = None;
                self.persist_failure(job, &reason)?;
                Err(reason)
            }
            JobResult::RetryAfter(delay) => {
                let reason = "retry after delay".to_string();
                job.mark_failed(reason.clone(), started);
                job.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                self.persist_failure(job, &reason)?;
                Err(reason)
            }
        }
    }

    /// Drop completed jobs older than `retention`. Failures are logged and skipped.
    pub fn purge_completed(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        match self.store.purge_completed(cutoff) {
            Ok(0) => 0,
            Ok(purged) => {
                debug!(purged, "purged completed jobs");
                purged
            }
            Err(e) => {
                warn!(error = %e, "failed to purge completed jobs");
                0
            }
        }
    }

    /// Store a failed attempt: dead-letter the job once its retries are spent.
    fn persist_failure(&self, job: &mut Job, error: &str) -> Result<(), String> {
        if matches!(job.status, JobStatus::DeadLettered { .. }) {
            warn!(job_id = %job.id, kind = %job.kind, error = %error, "job dead-lettered");
            self.store
                .dead_letter(job.clone(), error.to_string())
                .map_err(|e| e.to_string())
        } else {
            self.store.update(job).map_err(|e| e.to_string())
        }
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: &JobExecutor<S>,
    config: &JobExecutorConfig,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        if let Ok(mut s) = executor.stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match executor.store.claim_next() {
            Ok(Some(mut job)) => executor.run_claimed(&mut job),
            Ok(None) => {
                if let Some(retention) = config.completed_retention {
                    executor.purge_completed(retention);
                }
                thread::sleep(config.poll_interval);
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
