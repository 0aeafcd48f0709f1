use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use statecraft_core::{ModelId, Problem};

use crate::EventRef;

/// A single request to execute an event (command abstraction).
///
/// Commands represent **intent**: event + optional target model + optional
/// parameters. They are immutable once built; the processor decides whether
/// they are legal, valid and authorized.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    event: EventRef,
    model: Option<ModelId>,
    params: Option<JsonValue>,
}

impl Command {
    /// Command for a void event (no target model).
    pub fn void(event: EventRef) -> Self {
        Self {
            event,
            model: None,
            params: None,
        }
    }

    /// Command targeting an existing model.
    pub fn instance(event: EventRef, model: ModelId) -> Self {
        Self {
            event,
            model: Some(model),
            params: None,
        }
    }

    /// Attach typed parameters (serialized through serde).
    pub fn with_params<T: Serialize>(mut self, params: &T) -> Result<Self, Problem> {
        let value = serde_json::to_value(params).map_err(|e| {
            Problem::invalid_parameter(format!("parameters for {} do not serialize: {e}", self.event))
        })?;
        self.params = Some(value);
        Ok(self)
    }

    /// Attach already-serialized parameters.
    pub fn with_params_json(mut self, params: JsonValue) -> Self {
        self.params = Some(params);
        self
    }

    pub fn event(&self) -> &EventRef {
        &self.event
    }

    pub fn model(&self) -> Option<ModelId> {
        self.model
    }

    pub fn params_json(&self) -> Option<&JsonValue> {
        self.params.as_ref()
    }

    /// Decode the parameters. Missing parameters decode from `null`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, Problem> {
        let value = self.params.clone().unwrap_or(JsonValue::Null);
        serde_json::from_value(value).map_err(|e| {
            Problem::invalid_parameter(format!("malformed parameters for {}: {e}", self.event))
        })
    }
}

/// Idempotency token: one token identifies one submission.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandToken(Uuid);

impl CommandToken {
    /// A fresh, unique token.
    pub fn simple() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Token for a cascading command, derived deterministically from the parent.
    pub fn derived(parent: CommandToken, index: usize) -> Self {
        let name = format!("{}/{}", parent.0, index);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for CommandToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Per-submission processing options.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcessingOptions {
    pub token: CommandToken,
    /// Validate and authorize only; never write.
    pub dry_run: bool,
}

impl ProcessingOptions {
    pub fn new(token: CommandToken) -> Self {
        Self {
            token,
            dry_run: false,
        }
    }

    pub fn dry_run(token: CommandToken) -> Self {
        Self {
            token,
            dry_run: true,
        }
    }
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self::new(CommandToken::simple())
    }
}
