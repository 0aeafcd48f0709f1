use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use statecraft_core::{ExpectedVersion, ModelId, Problem, StoredModel};
use statecraft_machine::CommandToken;

/// One processed event, appended in the same batch as its writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub token: CommandToken,
    /// `model_type.EventName`.
    pub event: String,
    pub model_id: Option<ModelId>,
    pub actor: String,
    pub time: DateTime<Utc>,
    pub audit_extra: Option<String>,
}

/// A single model write with its optimistic concurrency expectation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert (`ExpectedVersion::Absent`) or replace the stored snapshot.
    Put {
        model: StoredModel,
        expected: ExpectedVersion,
    },
    Delete {
        id: ModelId,
        expected: ExpectedVersion,
    },
}

impl WriteOp {
    pub fn model_id(&self) -> ModelId {
        match self {
            WriteOp::Put { model, .. } => model.id,
            WriteOp::Delete { id, .. } => *id,
        }
    }
}

/// Something a submission read and based its decisions on. The commit
/// fails as a conflict unless it still holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCheck {
    /// A single model read (or found missing) and not written by the batch.
    Model { id: ModelId, expected: ExpectedVersion },
    /// The full membership of a type as listed, with member versions.
    Type {
        model_type: String,
        members: Vec<(ModelId, u64)>,
    },
}

impl ReadCheck {
    /// `members` in any order; they are kept sorted by id.
    pub fn listed(model_type: impl Into<String>, mut members: Vec<(ModelId, u64)>) -> Self {
        members.sort_unstable();
        ReadCheck::Type {
            model_type: model_type.into(),
            members,
        }
    }
}

/// Everything one submission writes. Applied entirely or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
    /// Checked against the store state before any op is applied.
    pub reads: Vec<ReadCheck>,
    /// Tokens to mark as processed. A token already seen rejects the batch.
    pub tokens: Vec<CommandToken>,
    pub log: Vec<EventLogEntry>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, model: StoredModel, expected: ExpectedVersion) -> Self {
        self.ops.push(WriteOp::Put { model, expected });
        self
    }

    pub fn delete(mut self, id: ModelId, expected: ExpectedVersion) -> Self {
        self.ops.push(WriteOp::Delete { id, expected });
        self
    }

    pub fn check(mut self, read: ReadCheck) -> Self {
        self.reads.push(read);
        self
    }

    pub fn token(mut self, token: CommandToken) -> Self {
        self.tokens.push(token);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.tokens.is_empty() && self.log.is_empty()
    }
}

/// Store operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("command token {0} was already processed")]
    DuplicateToken(CommandToken),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for Problem {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) | StoreError::DuplicateToken(_) => Problem::concurrent(err.to_string()),
            StoreError::Corrupt(_) | StoreError::Backend(_) => Problem::internal(err.to_string()),
        }
    }
}

/// Persistent snapshot store for managed models.
///
/// Implementations must:
/// - apply a [`WriteBatch`] atomically (ops, tokens and log entries together)
/// - check every op's `ExpectedVersion` against the stored version
/// - check every [`ReadCheck`] against the state before the batch, without
///   letting a concurrent commit slip in between check and apply
/// - reject a batch carrying an already processed token
/// - return `list_by_type` results in creation order
pub trait ModelStore: Send + Sync {
    fn load(&self, id: ModelId) -> Result<Option<StoredModel>, StoreError>;

    fn list_by_type(&self, model_type: &str) -> Result<Vec<StoredModel>, StoreError>;

    /// Total number of stored models, all types.
    fn count(&self) -> Result<usize, StoreError>;

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn token_seen(&self, token: CommandToken) -> Result<bool, StoreError>;

    /// Event log in append order.
    fn event_log(&self) -> Result<Vec<EventLogEntry>, StoreError>;

    fn save(&self, model: StoredModel, expected: ExpectedVersion) -> Result<(), StoreError> {
        self.commit(WriteBatch::new().put(model, expected))
    }

    fn delete(&self, id: ModelId, expected: ExpectedVersion) -> Result<(), StoreError> {
        self.commit(WriteBatch::new().delete(id, expected))
    }
}

impl<S> ModelStore for Arc<S>
where
    S: ModelStore + ?Sized,
{
    fn load(&self, id: ModelId) -> Result<Option<StoredModel>, StoreError> {
        (**self).load(id)
    }

    fn list_by_type(&self, model_type: &str) -> Result<Vec<StoredModel>, StoreError> {
        (**self).list_by_type(model_type)
    }

    fn count(&self) -> Result<usize, StoreError> {
        (**self).count()
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).commit(batch)
    }

    fn token_seen(&self, token: CommandToken) -> Result<bool, StoreError> {
        (**self).token_seen(token)
    }

    fn event_log(&self) -> Result<Vec<EventLogEntry>, StoreError> {
        (**self).event_log()
    }
}
