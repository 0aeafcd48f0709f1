//! Per-call identity and environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ModelId;

/// Who is acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActorIdentity {
    /// Nobody has authenticated.
    Unauthenticated,
    /// The engine itself or a trusted identity provider (time triggers, jobs, user provisioning).
    System,
    /// An authenticated actor represented by a model, with externally supplied groups.
    ///
    /// Groups come from the identity provider and are not stored by the engine.
    Authenticated { model: ModelId, groups: Vec<String> },
}

impl ActorIdentity {
    pub fn authenticated(model: ModelId, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Authenticated {
            model,
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Model id of the acting entity, if the actor is one.
    pub fn model_id(&self) -> Option<ModelId> {
        match self {
            ActorIdentity::Authenticated { model, .. } => Some(*model),
            _ => None,
        }
    }

    pub fn in_group(&self, group: &str) -> bool {
        match self {
            ActorIdentity::Authenticated { groups, .. } => groups.iter().any(|g| g == group),
            _ => false,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, ActorIdentity::System)
    }
}

impl core::fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ActorIdentity::Unauthenticated => f.write_str("unauthenticated"),
            ActorIdentity::System => f.write_str("system"),
            ActorIdentity::Authenticated { model, groups } => {
                write!(f, "model:{model} groups:[{}]", groups.join(","))
            }
        }
    }
}

/// Context supplied fresh for every submission or read.
///
/// `time` is the logical clock: validators, builders, time triggers and the
/// processor's timestamps all read it instead of the wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub actor: ActorIdentity,
    pub time: DateTime<Utc>,
    pub audit_extra: Option<String>,
}

impl Context {
    /// Context for `actor` at the current wall-clock time.
    pub fn new(actor: ActorIdentity) -> Self {
        Self {
            actor,
            time: Utc::now(),
            audit_extra: None,
        }
    }

    pub fn system() -> Self {
        Self::new(ActorIdentity::System)
    }

    pub fn unauthenticated() -> Self {
        Self::new(ActorIdentity::Unauthenticated)
    }

    /// Pin the logical clock (tests, replays, time triggers).
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn with_audit(mut self, extra: impl Into<String>) -> Self {
        self.audit_extra = Some(extra.into());
        self
    }
}
