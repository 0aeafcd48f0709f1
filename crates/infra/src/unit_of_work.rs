//! Staged writes of one submission.
//!
//! A [`UnitOfWork`] overlays the store: reads see the submission's own staged
//! writes, and nothing reaches the store until the processor turns the unit
//! into a single [`WriteBatch`]. Every model the unit reads or writes has its
//! store version recorded on first sight, and every listed type has its
//! membership recorded. The batch expects exactly what was seen, so a
//! concurrent writer (including one that inserts into a listed type) makes
//! the commit fail as a conflict.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use statecraft_core::{ExpectedVersion, ModelId, Problem, StoredModel};
use statecraft_machine::{CommandToken, JobRequest, ModelReader};

use crate::store::{EventLogEntry, ModelStore, ReadCheck, WriteBatch};

#[derive(Debug, Clone, Default)]
struct Staged {
    /// `None` marks a deletion.
    models: HashMap<ModelId, Option<StoredModel>>,
    order: Vec<ModelId>,
    log: Vec<EventLogEntry>,
    jobs: Vec<JobRequest>,
    created: Vec<ModelId>,
    deleted: Vec<ModelId>,
}

/// Snapshot taken by [`UnitOfWork::checkpoint`].
#[derive(Debug, Clone)]
pub struct Checkpoint(Staged);

/// What a finished unit of work hands to the store and the job queue.
#[derive(Debug, Clone)]
pub struct UnitOfWorkParts {
    pub batch: WriteBatch,
    pub jobs: Vec<JobRequest>,
    pub created: Vec<ModelId>,
    pub deleted: Vec<ModelId>,
}

pub struct UnitOfWork<'s> {
    store: &'s dyn ModelStore,
    /// Store version at first sight; `None` = absent from the store.
    observed: RefCell<HashMap<ModelId, Option<u64>>>,
    /// Store members of each listed type at first listing.
    listed: RefCell<HashMap<String, Vec<(ModelId, u64)>>>,
    staged: Staged,
}

impl<'s> UnitOfWork<'s> {
    pub fn new(store: &'s dyn ModelStore) -> Self {
        Self {
            store,
            observed: RefCell::new(HashMap::new()),
            listed: RefCell::new(HashMap::new()),
            staged: Staged::default(),
        }
    }

    fn observe(&self, id: ModelId, version: Option<u64>) {
        self.observed.borrow_mut().entry(id).or_insert(version);
    }

    fn ensure_observed(&self, id: ModelId) -> Result<(), Problem> {
        if self.observed.borrow().contains_key(&id) {
            return Ok(());
        }
        let version = self.store.load(id)?.map(|m| m.version);
        self.observe(id, version);
        Ok(())
    }

    fn touch(&mut self, id: ModelId) {
        if !self.staged.models.contains_key(&id) {
            self.staged.order.push(id);
        }
    }

    /// Stage a new or replaced snapshot.
    pub fn put(&mut self, model: StoredModel, created: bool) -> Result<(), Problem> {
        let id = model.id;
        self.ensure_observed(id)?;
        self.touch(id);
        if created {
            self.staged.created.push(id);
        }
        self.staged.models.insert(id, Some(model));
        Ok(())
    }

    pub fn delete(&mut self, id: ModelId) -> Result<(), Problem> {
        self.ensure_observed(id)?;
        self.touch(id);
        self.staged.deleted.push(id);
        self.staged.models.insert(id, None);
        Ok(())
    }

    pub fn record(&mut self, entry: EventLogEntry) {
        self.staged.log.push(entry);
    }

    pub fn queue_jobs(&mut self, jobs: impl IntoIterator<Item = JobRequest>) {
        self.staged.jobs.extend(jobs);
    }

    pub fn created(&self) -> &[ModelId] {
        &self.staged.created
    }

    pub fn deleted(&self) -> &[ModelId] {
        &self.staged.deleted
    }

    pub fn jobs(&self) -> &[JobRequest] {
        &self.staged.jobs
    }

    pub fn log(&self) -> &[EventLogEntry] {
        &self.staged.log
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.staged.clone())
    }

    /// Discard everything staged since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.staged = checkpoint.0;
    }

    /// Turn the staged writes into one batch carrying `token`.
    pub fn into_parts(self, token: CommandToken) -> UnitOfWorkParts {
        let observed = self.observed.into_inner();
        let Staged {
            mut models,
            order,
            log,
            jobs,
            created,
            deleted,
        } = self.staged;

        let mut batch = WriteBatch::new().token(token);
        for id in order {
            let Some(staged) = models.remove(&id) else {
                continue;
            };
            let base = observed.get(&id).copied().flatten();
            batch = match (base, staged) {
                // Created and deleted within the same submission.
                (None, None) => batch,
                (None, Some(model)) => batch.put(model, ExpectedVersion::Absent),
                (Some(version), Some(model)) => batch.put(model, ExpectedVersion::Exact(version)),
                (Some(version), None) => batch.delete(id, ExpectedVersion::Exact(version)),
            };
        }

        let written: HashSet<ModelId> = batch.ops.iter().map(|op| op.model_id()).collect();
        let mut reads: Vec<(ModelId, Option<u64>)> = observed
            .into_iter()
            .filter(|(id, _)| !written.contains(id))
            .collect();
        reads.sort_unstable();
        for (id, version) in reads {
            batch = batch.check(ReadCheck::Model {
                id,
                expected: ExpectedVersion::observed(version),
            });
        }
        let mut listed: Vec<_> = self.listed.into_inner().into_iter().collect();
        listed.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (model_type, members) in listed {
            batch = batch.check(ReadCheck::listed(model_type, members));
        }
        batch.log = log;

        UnitOfWorkParts {
            batch,
            jobs,
            created,
            deleted,
        }
    }
}

impl ModelReader for UnitOfWork<'_> {
    fn get_stored(&self, id: ModelId) -> Result<StoredModel, Problem> {
        if let Some(staged) = self.staged.models.get(&id) {
            return staged.clone().ok_or(Problem::NotFound);
        }
        let loaded = self.store.load(id)?;
        self.observe(id, loaded.as_ref().map(|m| m.version));
        loaded.ok_or(Problem::NotFound)
    }

    fn list_stored(&self, model_type: &str) -> Result<Vec<StoredModel>, Problem> {
        let stored = self.store.list_by_type(model_type)?;
        self.listed
            .borrow_mut()
            .entry(model_type.to_string())
            .or_insert_with(|| stored.iter().map(|m| (m.id, m.version)).collect());
        let mut seen = HashSet::with_capacity(stored.len());
        let mut out = Vec::with_capacity(stored.len());

        for model in stored {
            self.observe(model.id, Some(model.version));
            seen.insert(model.id);
            match self.staged.models.get(&model.id) {
                Some(Some(replaced)) => out.push(replaced.clone()),
                Some(None) => {}
                None => out.push(model),
            }
        }

        for id in &self.staged.order {
            if seen.contains(id) {
                continue;
            }
            if let Some(Some(model)) = self.staged.models.get(id) {
                if model.model_type == model_type {
                    out.push(model.clone());
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryModelStore, WriteOp};
    use chrono::Utc;
    use serde_json::json;

    fn note(title: &str) -> StoredModel {
        let now = Utc::now();
        StoredModel {
            id: ModelId::new(),
            model_type: "note".into(),
            state: "Draft".into(),
            props: json!({ "title": title }),
            created_at: now,
            last_state_transition_at: now,
            version: 1,
        }
    }

    #[test]
    fn staged_writes_are_visible_to_reads() {
        let store = InMemoryModelStore::new();
        let existing = note("old");
        store.save(existing.clone(), ExpectedVersion::Absent).unwrap();

        let mut uow = UnitOfWork::new(&store);
        let mut changed = existing.clone();
        changed.props = json!({ "title": "new" });
        changed.version = 2;
        uow.put(changed.clone(), false).unwrap();
        let fresh = note("fresh");
        uow.put(fresh.clone(), true).unwrap();

        assert_eq!(uow.get_stored(existing.id).unwrap(), changed);
        let listed = uow.list_stored("note").unwrap();
        assert_eq!(listed, vec![changed, fresh]);
        // Nothing written yet.
        assert_eq!(store.load(existing.id).unwrap(), Some(existing));
    }

    #[test]
    fn staged_deletion_hides_model() {
        let store = InMemoryModelStore::new();
        let existing = note("x");
        store.save(existing.clone(), ExpectedVersion::Absent).unwrap();

        let mut uow = UnitOfWork::new(&store);
        uow.delete(existing.id).unwrap();
        assert_eq!(uow.get_stored(existing.id), Err(Problem::NotFound));
        assert!(uow.list_stored("note").unwrap().is_empty());
    }

    #[test]
    fn rollback_discards_staged_work() {
        let store = InMemoryModelStore::new();
        let mut uow = UnitOfWork::new(&store);
        let kept = note("kept");
        uow.put(kept.clone(), true).unwrap();

        let checkpoint = uow.checkpoint();
        uow.put(note("dropped"), true).unwrap();
        uow.rollback(checkpoint);

        assert_eq!(uow.created(), &[kept.id]);
        assert_eq!(uow.list_stored("note").unwrap(), vec![kept]);
    }

    #[test]
    fn batch_expects_versions_seen_first() {
        let store = InMemoryModelStore::new();
        let existing = note("x");
        store.save(existing.clone(), ExpectedVersion::Absent).unwrap();

        let mut uow = UnitOfWork::new(&store);
        let read = uow.get_stored(existing.id).unwrap();
        let mut next = read.clone();
        next.version = 2;
        uow.put(next, false).unwrap();
        let fresh = note("fresh");
        uow.put(fresh.clone(), true).unwrap();
        let temporary = note("temporary");
        uow.put(temporary.clone(), true).unwrap();
        uow.delete(temporary.id).unwrap();

        let token = CommandToken::simple();
        let parts = uow.into_parts(token);
        assert_eq!(parts.batch.tokens, vec![token]);
        assert_eq!(parts.batch.ops.len(), 2);
        assert!(matches!(
            &parts.batch.ops[0],
            WriteOp::Put { expected: ExpectedVersion::Exact(1), model } if model.id == existing.id
        ));
        assert!(matches!(
            &parts.batch.ops[1],
            WriteOp::Put { expected: ExpectedVersion::Absent, model } if model.id == fresh.id
        ));
        assert_eq!(parts.created, vec![fresh.id, temporary.id]);
        assert_eq!(parts.deleted, vec![temporary.id]);
    }

    #[test]
    fn concurrent_change_makes_commit_conflict() {
        let store = InMemoryModelStore::new();
        let existing = note("x");
        store.save(existing.clone(), ExpectedVersion::Absent).unwrap();

        let mut uow = UnitOfWork::new(&store);
        let mut next = uow.get_stored(existing.id).unwrap();

        let mut sneaky = existing.clone();
        sneaky.version = 2;
        store.save(sneaky, ExpectedVersion::Exact(1)).unwrap();

        next.version = 2;
        uow.put(next, false).unwrap();
        let parts = uow.into_parts(CommandToken::simple());
        let err = store.commit(parts.batch).unwrap_err();
        assert!(matches!(Problem::from(err), Problem::ConcurrentModification(_)));
    }

    #[test]
    fn insert_into_listed_type_makes_commit_conflict() {
        let store = InMemoryModelStore::new();
        store.save(note("first"), ExpectedVersion::Absent).unwrap();

        let mut uow = UnitOfWork::new(&store);
        assert_eq!(uow.list_stored("note").unwrap().len(), 1);
        uow.put(note("mine"), true).unwrap();

        // Somebody else adds a note after we counted.
        store.save(note("theirs"), ExpectedVersion::Absent).unwrap();

        let parts = uow.into_parts(CommandToken::simple());
        assert!(parts.batch.reads.iter().any(|r| matches!(r, ReadCheck::Type { model_type, .. } if model_type == "note")));
        assert!(matches!(store.commit(parts.batch), Err(crate::store::StoreError::Conflict(_))));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn unchanged_reads_commit() {
        let store = InMemoryModelStore::new();
        let existing = note("x");
        store.save(existing.clone(), ExpectedVersion::Absent).unwrap();

        let mut uow = UnitOfWork::new(&store);
        uow.get_stored(existing.id).unwrap();
        uow.list_stored("note").unwrap();
        uow.put(note("y"), true).unwrap();
        store.commit(uow.into_parts(CommandToken::simple()).batch).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }
}
