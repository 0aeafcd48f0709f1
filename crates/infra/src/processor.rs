//! Command processing.
//!
//! One submission = one [`UnitOfWork`]. The processor resolves the target,
//! checks legality and validators, authorizes, applies the transition,
//! processes cascades inside the same unit and finally commits a single
//! atomic batch. The batch carries everything the decision read; when the
//! commit finds any of it changed, the whole submission is re-validated
//! against fresh data and retried. Jobs requested by `on_enter` hooks are enqueued only after
//! that commit succeeded.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use statecraft_auth::{AuthorizationRules, Category, RuleArgs, Subject};
use statecraft_core::{Context, JobId, ModelId, Problem};
use statecraft_machine::{Command, CommandToken, JobRequest, ModelReader, ProcessingOptions};

use crate::config::EngineConfig;
use crate::jobs::{JobKind, JobStore};
use crate::locks::ModelLocks;
use crate::registration::{ModelRegistry, ModelWrite, TransitionInput};
use crate::store::{EventLogEntry, ModelStore, StoreError};
use crate::unit_of_work::UnitOfWork;

/// Where a command comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Submitted through `Engine::submit`. Internal events are refused.
    External,
    /// Produced by another transition's cascade.
    Cascade,
    /// Fired by the time-trigger scheduler. Not subject to authorization.
    Scheduler,
}

/// A cascading command that failed while its parent still committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeFailure {
    pub event: String,
    pub model: Option<ModelId>,
    pub problem: Problem,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Success {
    /// The created or targeted model of the submitted command.
    pub primary_model_id: Option<ModelId>,
    pub created_model_ids: Vec<ModelId>,
    pub deleted_model_ids: Vec<ModelId>,
    /// Jobs enqueued after commit. Always empty for dry runs.
    pub jobs: Vec<JobId>,
    pub cascade_failures: Vec<CascadeFailure>,
    /// Nothing was written.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{problem}")]
pub struct Failure {
    pub problem: Problem,
}

impl From<Problem> for Failure {
    fn from(problem: Problem) -> Self {
        Self { problem }
    }
}

pub type CommandResult = Result<Success, Failure>;

/// Borrowed view over the engine's collaborators for processing commands.
pub struct CommandProcessor<'e> {
    pub store: &'e dyn ModelStore,
    pub registry: &'e ModelRegistry,
    pub rules: &'e AuthorizationRules,
    pub locks: &'e ModelLocks,
    pub jobs: &'e dyn JobStore,
    pub config: &'e EngineConfig,
}

impl CommandProcessor<'_> {
    pub fn handle(
        &self,
        command: &Command,
        context: &Context,
        options: ProcessingOptions,
        origin: Origin,
    ) -> CommandResult {
        let span = tracing::info_span!(
            "command",
            event = %command.event(),
            token = %options.token,
            actor = %context.actor,
        );
        let _entered = span.enter();

        match self.process(command, context, options, origin) {
            Ok(success) => {
                info!(
                    model = ?success.primary_model_id,
                    created = success.created_model_ids.len(),
                    deleted = success.deleted_model_ids.len(),
                    jobs = success.jobs.len(),
                    cascade_failures = success.cascade_failures.len(),
                    dry_run = success.dry_run,
                    "command accepted"
                );
                Ok(success)
            }
            Err(problem) => {
                info!(kind = problem.kind(), %problem, "command rejected");
                Err(Failure::from(problem))
            }
        }
    }

    fn process(
        &self,
        command: &Command,
        context: &Context,
        options: ProcessingOptions,
        origin: Origin,
    ) -> Result<Success, Problem> {
        if origin == Origin::External && !command.event().is_external() {
            return Err(Problem::unauthorized(format!(
                "{} is internal and cannot be submitted directly",
                command.event()
            )));
        }
        if self.store.token_seen(options.token)? {
            return Err(Problem::concurrent(format!(
                "command token {} was already processed",
                options.token
            )));
        }

        let _guard = command.model().map(|id| self.locks.acquire(id)).transpose()?;

        let attempts = self.config.max_commit_attempts.max(1);
        let mut attempt = 1;
        loop {
            let mut uow = UnitOfWork::new(self.store);
            let mut cascade_failures = Vec::new();
            let primary = self.step(&mut uow, command, context, options.token, origin, 0, &mut cascade_failures)?;

            if options.dry_run {
                return Ok(Success {
                    primary_model_id: primary,
                    created_model_ids: uow.created().to_vec(),
                    deleted_model_ids: uow.deleted().to_vec(),
                    jobs: Vec::new(),
                    cascade_failures,
                    dry_run: true,
                });
            }

            let parts = uow.into_parts(options.token);
            match self.store.commit(parts.batch) {
                Ok(()) => {
                    let jobs = self.enqueue(parts.jobs);
                    return Ok(Success {
                        primary_model_id: primary,
                        created_model_ids: parts.created,
                        deleted_model_ids: parts.deleted,
                        jobs,
                        cascade_failures,
                        dry_run: false,
                    });
                }
                // Something read while deciding has changed: decide again on fresh data.
                Err(StoreError::Conflict(reason)) if attempt < attempts => {
                    debug!(attempt, %reason, "commit conflicted, re-validating");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Process one command (and its cascades) into `uow`.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        uow: &mut UnitOfWork<'_>,
        command: &Command,
        context: &Context,
        token: CommandToken,
        origin: Origin,
        depth: usize,
        failures: &mut Vec<CascadeFailure>,
    ) -> Result<Option<ModelId>, Problem> {
        let event = command.event();
        let registration = self.registry.get(event.model_type())?;

        match (event.is_void(), command.model()) {
            (true, Some(_)) => {
                return Err(Problem::invalid_parameter(format!("{event} does not take a target model")));
            }
            (false, None) => {
                return Err(Problem::invalid_parameter(format!("{event} requires a target model")));
            }
            _ => {}
        }

        let current = match command.model() {
            Some(id) => {
                let stored = uow.get_stored(id)?;
                if stored.model_type != event.model_type() {
                    return Err(Problem::NotFound);
                }
                Some(stored)
            }
            None => None,
        };

        let effect = {
            let input = TransitionInput {
                context,
                command,
                current: current.as_ref(),
                reader: &*uow,
            };
            registration.check(&input)?;
            if origin != Origin::Scheduler {
                let args = RuleArgs {
                    context,
                    subject: Subject::Command(command),
                    reader: &*uow,
                };
                self.rules.authorize(Category::Commands, &args)?;
            }
            registration.execute(&input)?
        };

        match effect.write {
            Some(ModelWrite::Put(model)) => uow.put(model, effect.created)?,
            Some(ModelWrite::Delete(id)) => uow.delete(id)?,
            None => {}
        }
        uow.record(EventLogEntry {
            token,
            event: event.to_string(),
            model_id: effect.model_id,
            actor: context.actor.to_string(),
            time: context.time,
            audit_extra: context.audit_extra.clone(),
        });
        uow.queue_jobs(effect.jobs);

        if effect.cascades.is_empty() {
            return Ok(effect.model_id);
        }
        if depth >= self.config.max_cascade_depth {
            return Err(Problem::internal(format!(
                "cascade depth limit of {} exceeded at {event}",
                self.config.max_cascade_depth
            )));
        }

        for (index, cascade) in effect.cascades.iter().enumerate() {
            let cascade_token = CommandToken::derived(token, index);
            if depth > 0 {
                // Nested failures abort the enclosing top-level cascade.
                self.step(uow, cascade, context, cascade_token, Origin::Cascade, depth + 1, failures)?;
                continue;
            }

            let checkpoint = uow.checkpoint();
            if let Err(problem) =
                self.step(uow, cascade, context, cascade_token, Origin::Cascade, depth + 1, failures)
            {
                uow.rollback(checkpoint);
                warn!(cascade = %cascade.event(), model = ?cascade.model(), %problem, "cascading command failed");
                failures.push(CascadeFailure {
                    event: cascade.event().to_string(),
                    model: cascade.model(),
                    problem,
                });
            }
        }

        Ok(effect.model_id)
    }

    fn enqueue(&self, requests: Vec<JobRequest>) -> Vec<JobId> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let kind = JobKind::new(request.kind);
            match self
                .jobs
                .enqueue(kind.clone(), request.payload, self.config.job_retry_policy.clone())
            {
                Ok(id) => ids.push(id),
                // The transition is already committed; the job is lost but the caller still succeeds.
                Err(err) => warn!(%kind, error = %err, "failed to enqueue job"),
            }
        }
        ids
    }
}
