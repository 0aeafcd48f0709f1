//! Problem taxonomy reported by the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the engine's domain-facing APIs.
pub type ProblemResult<T> = Result<T, Problem>;

/// Why a command or a read could not be carried out.
///
/// Every failure crossing the public boundary is one of these kinds. Callers
/// (HTTP layers etc.) map them to their own status codes; the engine emits none.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Problem {
    /// The referenced model does not exist.
    #[error("not found")]
    NotFound,

    /// The event is not declared for the model's current state.
    #[error("event '{event}' is not legal in state '{state}'")]
    IllegalTransition { state: String, event: String },

    /// One or more validators rejected the command. All reasons are kept.
    #[error("invalid parameters: {}", .0.join("; "))]
    InvalidParameters(Vec<String>),

    /// No positive rule allowed the operation, or a negative rule denied it.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Stale precondition or a replayed command token.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Store or serialization fault (not caused by the caller's input).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Problem {
    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn illegal_transition(state: impl Into<String>, event: impl Into<String>) -> Self {
        Self::IllegalTransition {
            state: state.into(),
            event: event.into(),
        }
    }

    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameters(vec![reason.into()])
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized(reason.into())
    }

    pub fn concurrent(msg: impl Into<String>) -> Self {
        Self::ConcurrentModification(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable, transport-neutral name of the problem kind (for logs and metrics).
    pub fn kind(&self) -> &'static str {
        match self {
            Problem::NotFound => "not_found",
            Problem::IllegalTransition { .. } => "illegal_transition",
            Problem::InvalidParameters(_) => "invalid_parameters",
            Problem::Unauthorized(_) => "unauthorized",
            Problem::ConcurrentModification(_) => "concurrent_modification",
            Problem::Internal(_) => "internal",
        }
    }
}
