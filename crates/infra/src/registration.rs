//! Type-erased model registrations.
//!
//! Each model type is registered once with its [`StateMachine`]. The
//! processor, the scheduler and the start-up check only see the object-safe
//! [`ManagedModel`] trait, working on [`StoredModel`]s; the typed machine is
//! consulted behind it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use statecraft_core::{Context, Model, ModelId, ModelProps, Problem, StoredModel};
use statecraft_machine::{
    Command, EventArgs, EventRef, HookArgs, JobRequest, ModelReader, StateMachine, TransitionKind,
};

/// Input of one transition step.
pub struct TransitionInput<'a> {
    pub context: &'a Context,
    pub command: &'a Command,
    /// The target model; `None` for void events.
    pub current: Option<&'a StoredModel>,
    pub reader: &'a dyn ModelReader,
}

/// The write a step makes to its model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelWrite {
    Put(StoredModel),
    Delete(ModelId),
}

/// Everything a transition produces, computed without touching the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEffect {
    /// The created or targeted model.
    pub model_id: Option<ModelId>,
    pub created: bool,
    pub write: Option<ModelWrite>,
    pub cascades: Vec<Command>,
    pub jobs: Vec<JobRequest>,
}

/// Object-safe view of a registered model type.
pub trait ManagedModel: Send + Sync {
    fn model_type(&self) -> &'static str;

    fn is_state(&self, state: &str) -> bool;

    /// Events an external caller could submit for a model in `state` (`None` = void).
    fn external_events(&self, state: Option<&str>) -> Vec<EventRef>;

    /// Legality and validators. Fails with `IllegalTransition` or `InvalidParameters`.
    fn check(&self, input: &TransitionInput<'_>) -> Result<(), Problem>;

    /// Compute the transition's effect. Call only after [`check`](Self::check) passed.
    fn execute(&self, input: &TransitionInput<'_>) -> Result<TransitionEffect, Problem>;

    /// Internal commands whose time trigger is due at `now`.
    fn due_commands(&self, reader: &dyn ModelReader, now: DateTime<Utc>) -> Result<Vec<Command>, Problem>;

    /// Decode check used at start-up.
    fn verify(&self, stored: &StoredModel) -> Result<(), Problem>;
}

/// Registration of model type `P` with its state machine.
pub struct ModelRegistration<P> {
    machine: StateMachine<P>,
}

impl<P: ModelProps> ModelRegistration<P> {
    pub fn new(machine: StateMachine<P>) -> Self {
        Self { machine }
    }

    pub fn machine(&self) -> &StateMachine<P> {
        &self.machine
    }

    fn decode(input: &TransitionInput<'_>) -> Result<Option<Model<P>>, Problem> {
        input.current.map(StoredModel::decode::<P>).transpose()
    }
}

impl<P: ModelProps> ManagedModel for ModelRegistration<P> {
    fn model_type(&self) -> &'static str {
        P::MODEL_TYPE
    }

    fn is_state(&self, state: &str) -> bool {
        self.machine.is_state(state)
    }

    fn external_events(&self, state: Option<&str>) -> Vec<EventRef> {
        self.machine.external_events(state)
    }

    fn check(&self, input: &TransitionInput<'_>) -> Result<(), Problem> {
        let model = Self::decode(input)?;
        let state = model.as_ref().map(|m| m.state.as_str());
        self.machine.transition(state, input.command.event())?;

        let args = EventArgs {
            context: input.context,
            command: input.command,
            model: model.as_ref(),
            reader: input.reader,
        };
        let failures = self.machine.validate(&args);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Problem::InvalidParameters(failures))
        }
    }

    fn execute(&self, input: &TransitionInput<'_>) -> Result<TransitionEffect, Problem> {
        let model = Self::decode(input)?;
        let state = model.as_ref().map(|m| m.state.as_str());
        let spec = self.machine.transition(state, input.command.event())?;
        let now = input.context.time;

        let args = EventArgs {
            context: input.context,
            command: input.command,
            model: model.as_ref(),
            reader: input.reader,
        };

        // Cascades see the model as it was before this transition.
        let cascades = match &spec.cascade {
            Some(cascade) => cascade(&args)?,
            None => Vec::new(),
        };

        let (next, entered) = match &spec.kind {
            TransitionKind::CreateModel { initial, build } => {
                let created = Model {
                    id: ModelId::new(),
                    state: (*initial).to_string(),
                    props: build(&args)?,
                    created_at: now,
                    last_state_transition_at: now,
                    version: 1,
                };
                (Some(created), true)
            }
            TransitionKind::TransitionTo { target, update } => {
                let mut next = args.model()?.clone();
                if let Some(update) = update {
                    next.props = update(&args)?;
                }
                let entered = next.state != *target;
                next.state = (*target).to_string();
                next.last_state_transition_at = now;
                next.version += 1;
                (Some(next), entered)
            }
            TransitionKind::Delete => (None, false),
            TransitionKind::Stay => (args.model.cloned(), false),
        };

        let jobs = match (&next, entered) {
            (Some(model), true) => self.machine.on_enter_jobs(&HookArgs {
                context: input.context,
                model,
                reader: input.reader,
            }),
            _ => Vec::new(),
        };

        let write = match &spec.kind {
            TransitionKind::Delete => Some(ModelWrite::Delete(args.model()?.id)),
            TransitionKind::Stay => None,
            _ => next.as_ref().map(Model::encode).transpose()?.map(ModelWrite::Put),
        };

        Ok(TransitionEffect {
            model_id: next.as_ref().map(|m| m.id).or(input.current.map(|m| m.id)),
            created: spec.is_create(),
            write,
            cascades,
            jobs,
        })
    }

    fn due_commands(&self, reader: &dyn ModelReader, now: DateTime<Utc>) -> Result<Vec<Command>, Problem> {
        let timed = self.machine.timed_states();
        if timed.is_empty() {
            return Ok(Vec::new());
        }

        let mut due = Vec::new();
        for stored in reader.list_stored(P::MODEL_TYPE)? {
            if !timed.iter().any(|s| *s == stored.state) {
                continue;
            }
            let model = stored.decode::<P>()?;
            if let Some(trigger) = self
                .machine
                .time_triggers(&model.state)
                .iter()
                .find(|t| t.due_at(&model) <= now)
            {
                due.push(Command::instance(trigger.event, model.id));
            }
        }
        Ok(due)
    }

    fn verify(&self, stored: &StoredModel) -> Result<(), Problem> {
        if !self.machine.is_state(&stored.state) {
            return Err(Problem::internal(format!(
                "model {} is in state '{}', which '{}' does not declare",
                stored.id,
                stored.state,
                P::MODEL_TYPE
            )));
        }
        stored.decode::<P>().map(|_| ())
    }
}

/// Registered model types by name.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<&'static str, Box<dyn ManagedModel>>,
}

impl ModelRegistry {
    /// Returns `false` if the type was already registered.
    pub fn insert(&mut self, model: Box<dyn ManagedModel>) -> bool {
        let model_type = model.model_type();
        if self.models.contains_key(model_type) {
            return false;
        }
        self.models.insert(model_type, model);
        true
    }

    pub fn get(&self, model_type: &str) -> Result<&dyn ManagedModel, Problem> {
        self.models
            .get(model_type)
            .map(|m| m.as_ref())
            .ok_or_else(|| Problem::internal(format!("model type '{model_type}' is not registered")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ManagedModel> {
        self.models.values().map(|m| m.as_ref())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl core::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<&&str> = self.models.keys().collect();
        types.sort();
        f.debug_struct("ModelRegistry").field("types", &types).finish()
    }
}
