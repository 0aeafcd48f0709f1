use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use statecraft_core::{ModelId, StoredModel};
use statecraft_machine::CommandToken;

use super::r#trait::{EventLogEntry, ModelStore, ReadCheck, StoreError, WriteBatch, WriteOp};

#[derive(Debug, Default)]
struct State {
    /// Model snapshot plus its insertion sequence (for creation order).
    models: HashMap<ModelId, (u64, StoredModel)>,
    next_seq: u64,
    tokens: HashSet<CommandToken>,
    log: Vec<EventLogEntry>,
}

impl State {
    fn version(&self, id: ModelId) -> Option<u64> {
        self.models.get(&id).map(|(_, m)| m.version)
    }

    fn check(&self, read: &ReadCheck) -> Result<(), StoreError> {
        match read {
            ReadCheck::Model { id, expected } => {
                let current = self.version(*id);
                if !expected.matches(current) {
                    return Err(StoreError::Conflict(format!(
                        "model {id} changed after it was read: expected {expected:?}, found {current:?}"
                    )));
                }
            }
            ReadCheck::Type { model_type, members } => {
                let mut current: Vec<(ModelId, u64)> = self
                    .models
                    .values()
                    .filter(|(_, m)| &m.model_type == model_type)
                    .map(|(_, m)| (m.id, m.version))
                    .collect();
                current.sort_unstable();
                if &current != members {
                    return Err(StoreError::Conflict(format!(
                        "models of type '{model_type}' changed after they were listed"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// In-memory model store.
///
/// Intended for tests/dev and single-process hosts. A single `RwLock` makes
/// every batch atomic and gives readers a consistent snapshot.
#[derive(Debug, Default)]
pub struct InMemoryModelStore {
    state: RwLock<State>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

impl ModelStore for InMemoryModelStore {
    fn load(&self, id: ModelId) -> Result<Option<StoredModel>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.models.get(&id).map(|(_, m)| m.clone()))
    }

    fn list_by_type(&self, model_type: &str) -> Result<Vec<StoredModel>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut found: Vec<&(u64, StoredModel)> = state
            .models
            .values()
            .filter(|(_, m)| m.model_type == model_type)
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, m)| m.clone()).collect())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().map_err(poisoned)?.models.len())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.state.write().map_err(poisoned)?;
        let state = &mut *guard;

        if let Some(token) = batch.tokens.iter().find(|t| state.tokens.contains(*t)) {
            return Err(StoreError::DuplicateToken(*token));
        }

        for read in &batch.reads {
            state.check(read)?;
        }

        // Check every expectation against the versions the batch itself produces.
        let mut versions: HashMap<ModelId, Option<u64>> = HashMap::new();
        for op in &batch.ops {
            let id = op.model_id();
            let current = match versions.get(&id) {
                Some(v) => *v,
                None => state.models.get(&id).map(|(_, m)| m.version),
            };
            let (expected, next) = match op {
                WriteOp::Put { model, expected } => (*expected, Some(model.version)),
                WriteOp::Delete { expected, .. } => (*expected, None),
            };
            if !expected.matches(current) {
                return Err(StoreError::Conflict(format!(
                    "model {id}: expected {expected:?}, found {current:?}"
                )));
            }
            versions.insert(id, next);
        }

        for op in batch.ops {
            match op {
                WriteOp::Put { model, .. } => {
                    let seq = match state.models.get(&model.id) {
                        Some((seq, _)) => *seq,
                        None => {
                            state.next_seq += 1;
                            state.next_seq
                        }
                    };
                    state.models.insert(model.id, (seq, model));
                }
                WriteOp::Delete { id, .. } => {
                    state.models.remove(&id);
                }
            }
        }
        state.tokens.extend(batch.tokens);
        state.log.extend(batch.log);
        Ok(())
    }

    fn token_seen(&self, token: CommandToken) -> Result<bool, StoreError> {
        Ok(self.state.read().map_err(poisoned)?.tokens.contains(&token))
    }

    fn event_log(&self) -> Result<Vec<EventLogEntry>, StoreError> {
        Ok(self.state.read().map_err(poisoned)?.log.clone())
    }
}
