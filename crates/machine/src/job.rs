use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Deferred work requested by an `on_enter` hook.
///
/// The processor turns requests into jobs (assigning a numeric id) once the
/// triggering transition has committed. Handlers are registered by `kind` on
/// the job executor and must tolerate re-execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: String,
    pub payload: JsonValue,
}

impl JobRequest {
    pub fn new(kind: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}
