//! Managed models: typed view (`Model<P>`) and erased storage form (`StoredModel`).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Problem;
use crate::ModelId;

/// Props payload of a managed model type.
///
/// The serde implementation is the type's explicit serialization function:
/// the engine never inspects props any other way. Top-level fields of the
/// serialized object are the property names seen by property-read rules.
pub trait ModelProps:
    Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable type name (e.g. "todo").
    const MODEL_TYPE: &'static str;
}

/// A model instance as persisted: props in their serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredModel {
    pub id: ModelId,
    pub model_type: String,
    pub state: String,
    pub props: JsonValue,
    pub created_at: DateTime<Utc>,
    pub last_state_transition_at: DateTime<Utc>,
    /// Incremented on every persisted change (1 after creation).
    pub version: u64,
}

impl StoredModel {
    pub fn is_of<P: ModelProps>(&self) -> bool {
        self.model_type == P::MODEL_TYPE
    }

    /// Decode into a typed model. Fails if the type differs or props do not decode.
    pub fn decode<P: ModelProps>(&self) -> Result<Model<P>, Problem> {
        if !self.is_of::<P>() {
            return Err(Problem::internal(format!(
                "model {} is a '{}', not a '{}'",
                self.id,
                self.model_type,
                P::MODEL_TYPE
            )));
        }
        let props: P = serde_json::from_value(self.props.clone()).map_err(|e| {
            Problem::internal(format!("failed to decode props of model {}: {e}", self.id))
        })?;
        Ok(Model {
            id: self.id,
            state: self.state.clone(),
            props,
            created_at: self.created_at,
            last_state_transition_at: self.last_state_transition_at,
            version: self.version,
        })
    }
}

/// Typed model instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Model<P> {
    pub id: ModelId,
    pub state: String,
    pub props: P,
    pub created_at: DateTime<Utc>,
    pub last_state_transition_at: DateTime<Utc>,
    pub version: u64,
}

impl<P: ModelProps> Model<P> {
    pub fn encode(&self) -> Result<StoredModel, Problem> {
        let props = encode_props(&self.props)?;
        Ok(StoredModel {
            id: self.id,
            model_type: P::MODEL_TYPE.to_string(),
            state: self.state.clone(),
            props,
            created_at: self.created_at,
            last_state_transition_at: self.last_state_transition_at,
            version: self.version,
        })
    }
}

/// Serialize props through the type's serde implementation.
pub fn encode_props<P: ModelProps>(props: &P) -> Result<JsonValue, Problem> {
    serde_json::to_value(props)
        .map_err(|e| Problem::internal(format!("failed to encode '{}' props: {e}", P::MODEL_TYPE)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl ModelProps for Note {
        const MODEL_TYPE: &'static str = "note";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other;

    impl ModelProps for Other {
        const MODEL_TYPE: &'static str = "other";
    }

    fn stored() -> StoredModel {
        let now = Utc::now();
        StoredModel {
            id: ModelId::new(),
            model_type: "note".into(),
            state: "Draft".into(),
            props: serde_json::json!({ "text": "hi" }),
            created_at: now,
            last_state_transition_at: now,
            version: 1,
        }
    }

    #[test]
    fn decode_then_encode_preserves_everything() {
        let s = stored();
        let typed = s.decode::<Note>().unwrap();
        assert_eq!(typed.props.text, "hi");
        assert_eq!(typed.encode().unwrap(), s);
    }

    #[test]
    fn decode_rejects_other_model_types() {
        assert!(matches!(stored().decode::<Other>(), Err(Problem::Internal(_))));
    }
}
