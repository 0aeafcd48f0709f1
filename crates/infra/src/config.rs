//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::RetryPolicy;

pub const SCHEDULER_TICK_ENV: &str = "STATECRAFT_SCHEDULER_TICK_MS";
pub const JOB_POLL_ENV: &str = "STATECRAFT_JOB_POLL_MS";
pub const MAX_CASCADE_DEPTH_ENV: &str = "STATECRAFT_MAX_CASCADE_DEPTH";
pub const BACKGROUND_WORKERS_ENV: &str = "STATECRAFT_BACKGROUND_WORKERS";
pub const COMMIT_ATTEMPTS_ENV: &str = "STATECRAFT_COMMIT_ATTEMPTS";
pub const JOB_RETENTION_ENV: &str = "STATECRAFT_JOB_RETENTION_SECS";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How often the time-trigger scheduler wakes up.
    pub scheduler_tick: Duration,
    /// How often the job executor polls for ready jobs.
    pub job_poll_interval: Duration,
    /// Nesting limit for cascading commands.
    pub max_cascade_depth: usize,
    /// How often a submission is re-validated and retried when its commit
    /// finds that something it read has changed. At least one attempt is made.
    pub max_commit_attempts: usize,
    /// Policy given to every job queued by an `on_enter` hook.
    pub job_retry_policy: RetryPolicy,
    /// How long the background executor keeps completed jobs queryable.
    pub completed_job_retention: Duration,
    /// Spawn the scheduler and job executor threads on `Engine::start`.
    pub run_background_workers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_tick: Duration::from_secs(1),
            job_poll_interval: Duration::from_millis(100),
            max_cascade_depth: 8,
            max_commit_attempts: 5,
            job_retry_policy: RetryPolicy::default(),
            completed_job_retention: Duration::from_secs(3600),
            run_background_workers: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `STATECRAFT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            scheduler_tick: parse_or(&lookup, SCHEDULER_TICK_ENV, None)
                .map(Duration::from_millis)
                .unwrap_or(defaults.scheduler_tick),
            job_poll_interval: parse_or(&lookup, JOB_POLL_ENV, None)
                .map(Duration::from_millis)
                .unwrap_or(defaults.job_poll_interval),
            max_cascade_depth: parse_or(&lookup, MAX_CASCADE_DEPTH_ENV, Some(defaults.max_cascade_depth))
                .unwrap_or(defaults.max_cascade_depth),
            max_commit_attempts: parse_or(&lookup, COMMIT_ATTEMPTS_ENV, Some(defaults.max_commit_attempts))
                .unwrap_or(defaults.max_commit_attempts),
            job_retry_policy: defaults.job_retry_policy,
            completed_job_retention: parse_or(&lookup, JOB_RETENTION_ENV, None)
                .map(Duration::from_secs)
                .unwrap_or(defaults.completed_job_retention),
            run_background_workers: parse_or(
                &lookup,
                BACKGROUND_WORKERS_ENV,
                Some(defaults.run_background_workers),
            )
            .unwrap_or(defaults.run_background_workers),
        }
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    pub fn with_max_commit_attempts(mut self, attempts: usize) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    pub fn with_job_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.job_retry_policy = policy;
        self
    }

    pub fn with_completed_job_retention(mut self, retention: Duration) -> Self {
        self.completed_job_retention = retention;
        self
    }

    pub fn with_background_workers(mut self, enabled: bool) -> Self {
        self.run_background_workers = enabled;
        self
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, fallback: Option<T>) -> Option<T>
where
    T: FromStr + core::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, default = ?fallback, "malformed configuration value, using default");
            fallback
        }
    }
}
