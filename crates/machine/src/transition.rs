//! Transition specifications and the argument bundles handed to user functions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use statecraft_core::{Context, Model, Problem};

use crate::{Command, JobRequest, ModelReader, Validity};

/// Arguments for validators, builders, prop updates and cascades.
pub struct EventArgs<'a, P> {
    pub context: &'a Context,
    pub command: &'a Command,
    /// The target model; `None` for void events.
    pub model: Option<&'a Model<P>>,
    pub reader: &'a dyn ModelReader,
}

impl<'a, P> EventArgs<'a, P> {
    /// Decode the command parameters.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, Problem> {
        self.command.params()
    }

    /// The target model, for functions attached to instance events.
    pub fn model(&self) -> Result<&'a Model<P>, Problem> {
        self.model.ok_or_else(|| {
            Problem::internal(format!("{} has no target model", self.command.event()))
        })
    }
}

/// Arguments for hooks that are not tied to an event (`on_enter`).
pub struct HookArgs<'a, P> {
    pub context: &'a Context,
    pub model: &'a Model<P>,
    pub reader: &'a dyn ModelReader,
}

pub type ValidatorFn<P> = Arc<dyn Fn(&EventArgs<'_, P>) -> Validity + Send + Sync>;
pub type BuildFn<P> = Arc<dyn Fn(&EventArgs<'_, P>) -> Result<P, Problem> + Send + Sync>;
pub type CascadeFn<P> = Arc<dyn Fn(&EventArgs<'_, P>) -> Result<Vec<Command>, Problem> + Send + Sync>;
pub type OnEnterFn<P> = Arc<dyn Fn(&HookArgs<'_, P>) -> Vec<JobRequest> + Send + Sync>;
pub type TriggerFn<P> = Arc<dyn Fn(&Model<P>) -> DateTime<Utc> + Send + Sync>;

/// What a transition does to the model.
pub enum TransitionKind<P> {
    /// Void → `initial`, props produced by `build`.
    CreateModel { initial: &'static str, build: BuildFn<P> },
    /// Move to `target`; props are kept unless `update` supplies new ones.
    TransitionTo {
        target: &'static str,
        update: Option<BuildFn<P>>,
    },
    /// Remove the model from the store.
    Delete,
    /// Keep state and props (used for cascade-only events).
    Stay,
}

/// One entry of the `state → event → transition` table.
pub struct TransitionSpec<P> {
    pub kind: TransitionKind<P>,
    /// Commands submitted as a consequence of this transition.
    ///
    /// Cascades are computed before the transition is applied, so a parent
    /// `Delete` can still describe its children.
    pub cascade: Option<CascadeFn<P>>,
}

impl<P> TransitionSpec<P> {
    pub fn create_model<F>(initial: &'static str, build: F) -> Self
    where
        F: Fn(&EventArgs<'_, P>) -> Result<P, Problem> + Send + Sync + 'static,
    {
        Self {
            kind: TransitionKind::CreateModel {
                initial,
                build: Arc::new(build),
            },
            cascade: None,
        }
    }

    pub fn transition_to(target: &'static str) -> Self {
        Self {
            kind: TransitionKind::TransitionTo { target, update: None },
            cascade: None,
        }
    }

    /// Transition that also replaces the props.
    pub fn transition_with<F>(target: &'static str, update: F) -> Self
    where
        F: Fn(&EventArgs<'_, P>) -> Result<P, Problem> + Send + Sync + 'static,
    {
        Self {
            kind: TransitionKind::TransitionTo {
                target,
                update: Some(Arc::new(update)),
            },
            cascade: None,
        }
    }

    pub fn delete() -> Self {
        Self {
            kind: TransitionKind::Delete,
            cascade: None,
        }
    }

    /// Stay in the current state and only emit cascading commands.
    pub fn create_commands<F>(cascade: F) -> Self
    where
        F: Fn(&EventArgs<'_, P>) -> Result<Vec<Command>, Problem> + Send + Sync + 'static,
    {
        Self {
            kind: TransitionKind::Stay,
            cascade: Some(Arc::new(cascade)),
        }
    }

    /// Attach cascading commands to any transition.
    pub fn with_cascade<F>(mut self, cascade: F) -> Self
    where
        F: Fn(&EventArgs<'_, P>) -> Result<Vec<Command>, Problem> + Send + Sync + 'static,
    {
        self.cascade = Some(Arc::new(cascade));
        self
    }

    /// The state the model is in after the transition (`None` when deleted, or unchanged for `Stay`).
    pub fn target_state(&self) -> Option<&'static str> {
        match &self.kind {
            TransitionKind::CreateModel { initial, .. } => Some(initial),
            TransitionKind::TransitionTo { target, .. } => Some(target),
            TransitionKind::Delete | TransitionKind::Stay => None,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self.kind, TransitionKind::CreateModel { .. })
    }
}

impl<P> core::fmt::Debug for TransitionSpec<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match &self.kind {
            TransitionKind::CreateModel { initial, .. } => format!("create_model({initial})"),
            TransitionKind::TransitionTo { target, update } => {
                format!("transition_to({target}, update={})", update.is_some())
            }
            TransitionKind::Delete => "delete".to_string(),
            TransitionKind::Stay => "stay".to_string(),
        };
        f.debug_struct("TransitionSpec")
            .field("kind", &kind)
            .field("cascade", &self.cascade.is_some())
            .finish()
    }
}
