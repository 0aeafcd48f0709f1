//! State machine definition and builder.
//!
//! The definition is a plain data structure: `state → (event → TransitionSpec)`
//! plus per-event validators and per-state hooks. It is built once at startup
//! and shared immutably afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use statecraft_core::{Model, ModelProps, Problem};

use crate::transition::{OnEnterFn, TriggerFn, ValidatorFn};
use crate::validation::collect_failures;
use crate::{EventArgs, EventRef, HookArgs, JobRequest, TransitionKind, TransitionSpec, Validity};

/// Invalid state machine definition (detected at build time).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("state machine for '{0}' declares no states")]
    NoStates(String),

    #[error("state '{0}' is declared twice")]
    DuplicateState(String),

    #[error("state '{0}' is not declared")]
    UnknownState(String),

    #[error("event '{0}' is used but never declared with `event(..)`")]
    UndeclaredEvent(String),

    #[error("event '{event}' belongs to '{event_type}', not '{machine_type}'")]
    ForeignEvent {
        event: String,
        event_type: String,
        machine_type: String,
    },

    #[error("event '{0}' is declared twice")]
    DuplicateEvent(String),

    #[error("event '{0}': void events are only legal in the void state, instance events only in named states")]
    WrongShape(String),

    #[error("event '{0}': the void state has no model to transition or delete")]
    VoidWithoutModel(String),

    #[error("event '{0}': create_model is only allowed from the void state")]
    CreateOutsideVoid(String),

    #[error("time trigger in state '{state}' uses event '{event}', which must be internal and have a transition in that state")]
    InvalidTimeTrigger { state: String, event: String },
}

/// A time-triggered transition: when `trigger(model)` is due, the engine submits `event`.
pub struct AtTime<P> {
    pub event: EventRef,
    pub trigger: TriggerFn<P>,
}

impl<P> AtTime<P> {
    pub fn due_at(&self, model: &Model<P>) -> DateTime<Utc> {
        (self.trigger)(model)
    }
}

/// Per-state configuration.
pub struct StateDef<P> {
    name: &'static str,
    transitions: HashMap<EventRef, TransitionSpec<P>>,
    on_enter: Vec<OnEnterFn<P>>,
    at_time: Vec<AtTime<P>>,
}

impl<P> StateDef<P> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            transitions: HashMap::new(),
            on_enter: Vec::new(),
            at_time: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn on_event(mut self, event: EventRef, transition: TransitionSpec<P>) -> Self {
        self.transitions.insert(event, transition);
        self
    }

    /// Queue jobs whenever a model enters this state.
    pub fn on_enter<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HookArgs<'_, P>) -> Vec<JobRequest> + Send + Sync + 'static,
    {
        self.on_enter.push(Arc::new(hook));
        self
    }

    /// Submit the internal `event` once `trigger(model)` has passed.
    pub fn at_time<F>(mut self, event: EventRef, trigger: F) -> Self
    where
        F: Fn(&Model<P>) -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.at_time.push(AtTime {
            event,
            trigger: Arc::new(trigger),
        });
        self
    }

    pub fn transitions(&self) -> impl Iterator<Item = (&EventRef, &TransitionSpec<P>)> {
        self.transitions.iter()
    }

    pub fn time_triggers(&self) -> &[AtTime<P>] {
        &self.at_time
    }
}

/// Per-event configuration (validators).
pub struct EventConfig<P> {
    validators: Vec<ValidatorFn<P>>,
}

impl<P> EventConfig<P> {
    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&EventArgs<'_, P>) -> Validity + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
        self
    }
}

/// Immutable state machine of one model type.
pub struct StateMachine<P> {
    states: Vec<&'static str>,
    events: HashMap<EventRef, Vec<ValidatorFn<P>>>,
    void_state: StateDef<P>,
    state_defs: HashMap<&'static str, StateDef<P>>,
}

impl<P: ModelProps> StateMachine<P> {
    pub fn builder() -> StateMachineBuilder<P> {
        StateMachineBuilder::new()
    }

    pub fn model_type(&self) -> &'static str {
        P::MODEL_TYPE
    }

    pub fn states(&self) -> &[&'static str] {
        &self.states
    }

    pub fn is_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| *s == state)
    }

    fn state_def(&self, state: Option<&str>) -> Option<&StateDef<P>> {
        match state {
            None => Some(&self.void_state),
            Some(s) => self.state_defs.get(s),
        }
    }

    /// Is `event` declared for `state`? `None` is the void (pre-creation) pseudo-state.
    pub fn is_event_legal(&self, state: Option<&str>, event: &EventRef) -> bool {
        self.state_def(state)
            .is_some_and(|def| def.transitions.contains_key(event))
    }

    /// The transition for `event` in `state`, or `Problem::IllegalTransition`.
    pub fn transition(&self, state: Option<&str>, event: &EventRef) -> Result<&TransitionSpec<P>, Problem> {
        self.state_def(state)
            .and_then(|def| def.transitions.get(event))
            .ok_or_else(|| Problem::illegal_transition(state.unwrap_or("void"), event.name()))
    }

    /// Events legal in `state`, sorted by name.
    pub fn legal_events(&self, state: Option<&str>) -> Vec<EventRef> {
        let mut events: Vec<EventRef> = self
            .state_def(state)
            .map(|def| def.transitions.keys().copied().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.name());
        events
    }

    /// Externally invocable events legal in `state`.
    pub fn external_events(&self, state: Option<&str>) -> Vec<EventRef> {
        self.legal_events(state)
            .into_iter()
            .filter(EventRef::is_external)
            .collect()
    }

    pub fn is_declared(&self, event: &EventRef) -> bool {
        self.events.contains_key(event)
    }

    /// Run every validator of the event, returning all failure reasons.
    pub fn validate(&self, args: &EventArgs<'_, P>) -> Vec<String> {
        let Some(validators) = self.events.get(args.command.event()) else {
            return vec![];
        };
        collect_failures(validators.iter().map(|v| v(args)))
    }

    /// Jobs requested by the `on_enter` hooks of the model's current state.
    pub fn on_enter_jobs(&self, args: &HookArgs<'_, P>) -> Vec<JobRequest> {
        self.state_defs
            .get(args.model.state.as_str())
            .map(|def| def.on_enter.iter().flat_map(|hook| hook(args)).collect())
            .unwrap_or_default()
    }

    /// Time triggers declared for `state`.
    pub fn time_triggers(&self, state: &str) -> &[AtTime<P>] {
        self.state_defs
            .get(state)
            .map(|def| def.time_triggers())
            .unwrap_or(&[])
    }

    /// States that declare at least one time trigger.
    pub fn timed_states(&self) -> Vec<&'static str> {
        self.states
            .iter()
            .copied()
            .filter(|s| !self.time_triggers(s).is_empty())
            .collect()
    }
}

/// Builder for [`StateMachine`].
///
/// ```ignore
/// let machine = StateMachine::<Todo>::builder()
///     .states(&[CREATED, COMPLETED])
///     .event(CREATE_TODO, |e| e.validate(title_not_blank))
///     .event(MARK_COMPLETE, |e| e)
///     .void_state(|s| s.on_event(CREATE_TODO, TransitionSpec::create_model(CREATED, create_todo)))
///     .state(CREATED, |s| s.on_event(MARK_COMPLETE, TransitionSpec::transition_to(COMPLETED)))
///     .build()?;
/// ```
pub struct StateMachineBuilder<P> {
    states: Vec<&'static str>,
    events: HashMap<EventRef, Vec<ValidatorFn<P>>>,
    void_state: StateDef<P>,
    state_defs: HashMap<&'static str, StateDef<P>>,
    errors: Vec<DefinitionError>,
}

impl<P: ModelProps> StateMachineBuilder<P> {
    fn new() -> Self {
        Self {
            states: Vec::new(),
            events: HashMap::new(),
            void_state: StateDef::new("void"),
            state_defs: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn states(mut self, states: &[&'static str]) -> Self {
        for s in states {
            if self.states.contains(s) {
                self.errors.push(DefinitionError::DuplicateState(s.to_string()));
            } else {
                self.states.push(s);
            }
        }
        self
    }

    pub fn event<F>(mut self, event: EventRef, configure: F) -> Self
    where
        F: FnOnce(EventConfig<P>) -> EventConfig<P>,
    {
        if self.events.contains_key(&event) {
            self.errors.push(DefinitionError::DuplicateEvent(event.to_string()));
            return self;
        }
        let config = configure(EventConfig { validators: Vec::new() });
        self.events.insert(event, config.validators);
        self
    }

    pub fn void_state<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(StateDef<P>) -> StateDef<P>,
    {
        let current = std::mem::replace(&mut self.void_state, StateDef::new("void"));
        self.void_state = configure(current);
        self
    }

    pub fn state<F>(mut self, state: &'static str, configure: F) -> Self
    where
        F: FnOnce(StateDef<P>) -> StateDef<P>,
    {
        let current = self
            .state_defs
            .remove(state)
            .unwrap_or_else(|| StateDef::new(state));
        self.state_defs.insert(state, configure(current));
        self
    }

    pub fn build(self) -> Result<StateMachine<P>, DefinitionError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        if self.states.is_empty() {
            return Err(DefinitionError::NoStates(P::MODEL_TYPE.to_string()));
        }

        for event in self.events.keys() {
            if event.model_type() != P::MODEL_TYPE {
                return Err(DefinitionError::ForeignEvent {
                    event: event.to_string(),
                    event_type: event.model_type().to_string(),
                    machine_type: P::MODEL_TYPE.to_string(),
                });
            }
        }

        let declared: HashSet<&'static str> = self.states.iter().copied().collect();
        let check_target = |spec: &TransitionSpec<P>| -> Result<(), DefinitionError> {
            match spec.target_state() {
                Some(target) if !declared.contains(target) => {
                    Err(DefinitionError::UnknownState(target.to_string()))
                }
                _ => Ok(()),
            }
        };

        for (event, spec) in &self.void_state.transitions {
            if !self.events.contains_key(event) {
                return Err(DefinitionError::UndeclaredEvent(event.to_string()));
            }
            if !event.is_void() {
                return Err(DefinitionError::WrongShape(event.to_string()));
            }
            if matches!(spec.kind, TransitionKind::Delete | TransitionKind::TransitionTo { .. }) {
                return Err(DefinitionError::VoidWithoutModel(event.to_string()));
            }
            check_target(spec)?;
        }

        for (name, def) in &self.state_defs {
            if !declared.contains(name) {
                return Err(DefinitionError::UnknownState(name.to_string()));
            }
            for (event, spec) in &def.transitions {
                if !self.events.contains_key(event) {
                    return Err(DefinitionError::UndeclaredEvent(event.to_string()));
                }
                if event.is_void() {
                    return Err(DefinitionError::WrongShape(event.to_string()));
                }
                if spec.is_create() {
                    return Err(DefinitionError::CreateOutsideVoid(event.to_string()));
                }
                check_target(spec)?;
            }
            for trigger in &def.at_time {
                let has_transition = def.transitions.contains_key(&trigger.event);
                if trigger.event.is_external() || !has_transition {
                    return Err(DefinitionError::InvalidTimeTrigger {
                        state: name.to_string(),
                        event: trigger.event.to_string(),
                    });
                }
            }
        }

        Ok(StateMachine {
            states: self.states,
            events: self.events,
            void_state: self.void_state,
            state_defs: self.state_defs,
        })
    }
}
