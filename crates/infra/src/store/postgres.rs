//! Postgres-backed model store (feature `postgres`).
//!
//! ## Error Mapping
//!
//! | SQLx error | Code | StoreError |
//! |------------|------|------------|
//! | Database (unique violation) | `23505` | `Conflict` (model inserted concurrently) |
//! | Database (other) | any | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |
//!
//! Version checks are done with conditional `UPDATE`/`DELETE` statements; a
//! statement that affects no row means the expectation did not hold.
//!
//! Read checks need the listed types to stay put until the transaction ends.
//! Every commit takes a transaction-scoped advisory lock per model type it
//! checks or writes, in sorted order, before checking anything.
//!
//! ## Sync bridge
//!
//! [`ModelStore`] is synchronous. The store keeps the tokio runtime handle it
//! was created on and blocks on it. Called from inside a runtime worker it
//! uses `block_in_place`, which requires the multi-threaded runtime; calls
//! from a current-thread runtime are refused with `StoreError::Backend`.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::RuntimeFlavor;
use tracing::instrument;
use uuid::Uuid;

use statecraft_core::{ExpectedVersion, ModelId, StoredModel};
use statecraft_machine::CommandToken;

use super::r#trait::{EventLogEntry, ModelStore, ReadCheck, StoreError, WriteBatch, WriteOp};

const SCHEMA: &str = include_str!("../../migrations/0001_models.sql");

#[derive(Debug, Clone)]
pub struct PostgresModelStore {
    pool: Arc<PgPool>,
    handle: tokio::runtime::Handle,
}

impl PostgresModelStore {
    /// Must be called from within a tokio runtime; its handle is kept for the sync bridge.
    ///
    /// The synchronous [`ModelStore`] methods may then be called from plain
    /// threads or from a multi-threaded runtime. From a current-thread
    /// runtime they return [`StoreError::Backend`].
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            StoreError::Backend("PostgresModelStore must be created inside a tokio runtime".to_string())
        })?;
        Ok(Self::with_handle(pool, handle))
    }

    pub fn with_handle(pool: PgPool, handle: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Run `fut` to completion on the store's runtime.
    ///
    /// Inside a current-thread runtime there is no worker to hand the
    /// blocked thread's tasks to, so the call fails instead of blocking.
    fn block<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => Err(StoreError::Backend(
                "PostgresModelStore cannot block inside a current-thread tokio runtime; \
                 use the multi-threaded runtime or call it from a plain thread"
                    .to_string(),
            )),
            Ok(_) => tokio::task::block_in_place(|| self.handle.block_on(fut)),
            Err(_) => self.handle.block_on(fut),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn load_model(&self, id: ModelId) -> Result<Option<StoredModel>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, model_type, state, props, created_at, last_state_transition_at, version
            FROM models
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        row.as_ref().map(model_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn list_models(&self, model_type: &str) -> Result<Vec<StoredModel>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, model_type, state, props, created_at, last_state_transition_at, version
            FROM models
            WHERE model_type = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(model_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_type", e))?;

        rows.iter().map(model_from_row).collect()
    }

    pub async fn count_models(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM models")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        usize::try_from(count).map_err(|e| StoreError::Corrupt(format!("model count {count}: {e}")))
    }

    /// Apply a batch inside one transaction.
    #[instrument(
        skip(self, batch),
        fields(ops = batch.ops.len(), reads = batch.reads.len(), tokens = batch.tokens.len()),
        err
    )]
    pub async fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        for token in &batch.tokens {
            let inserted = sqlx::query("INSERT INTO processed_tokens (token) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(token.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("record_token", e))?;
            if inserted.rows_affected() == 0 {
                return Err(StoreError::DuplicateToken(*token));
            }
        }

        lock_types(&mut tx, &batch).await?;
        for read in &batch.reads {
            check_read(&mut tx, read).await?;
        }
        for op in &batch.ops {
            apply_op(&mut tx, op).await?;
        }

        for entry in &batch.log {
            sqlx::query(
                r#"
                INSERT INTO event_log (token, event, model_id, actor, time, audit_extra)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entry.token.as_uuid())
            .bind(&entry.event)
            .bind(entry.model_id.map(|id| *id.as_uuid()))
            .bind(&entry.actor)
            .bind(entry.time)
            .bind(&entry.audit_extra)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_log", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    pub async fn is_token_seen(&self, token: CommandToken) -> Result<bool, StoreError> {
        let seen: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM processed_tokens WHERE token = $1)")
            .bind(token.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("token_seen", e))?;
        Ok(seen)
    }

    pub async fn load_event_log(&self) -> Result<Vec<EventLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT token, event, model_id, actor, time, audit_extra
            FROM event_log
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("event_log", e))?;

        rows.iter()
            .map(|row| {
                Ok(EventLogEntry {
                    token: CommandToken::from_uuid(row.try_get::<Uuid, _>("token").map_err(corrupt)?),
                    event: row.try_get("event").map_err(corrupt)?,
                    model_id: row
                        .try_get::<Option<Uuid>, _>("model_id")
                        .map_err(corrupt)?
                        .map(ModelId::from_uuid),
                    actor: row.try_get("actor").map_err(corrupt)?,
                    time: row.try_get::<DateTime<Utc>, _>("time").map_err(corrupt)?,
                    audit_extra: row.try_get("audit_extra").map_err(corrupt)?,
                })
            })
            .collect()
    }
}

/// Serialize commits touching the same model types.
async fn lock_types(tx: &mut Transaction<'_, Postgres>, batch: &WriteBatch) -> Result<(), StoreError> {
    let mut types: Vec<String> = Vec::new();
    let mut ids: Vec<Uuid> = Vec::new();
    for read in &batch.reads {
        match read {
            ReadCheck::Type { model_type, .. } => types.push(model_type.clone()),
            ReadCheck::Model { id, .. } => ids.push(*id.as_uuid()),
        }
    }
    for op in &batch.ops {
        match op {
            WriteOp::Put { model, .. } => types.push(model.model_type.clone()),
            WriteOp::Delete { id, .. } => ids.push(*id.as_uuid()),
        }
    }
    if !ids.is_empty() {
        let found: Vec<String> = sqlx::query_scalar("SELECT DISTINCT model_type FROM models WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lookup_types", e))?;
        types.extend(found);
    }
    types.sort_unstable();
    types.dedup();

    for model_type in &types {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(model_type)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_type", e))?;
    }
    Ok(())
}

async fn check_read(tx: &mut Transaction<'_, Postgres>, read: &ReadCheck) -> Result<(), StoreError> {
    match read {
        ReadCheck::Model { id, expected } => {
            let version: Option<i64> = sqlx::query_scalar("SELECT version FROM models WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("check_model", e))?;
            let current = version
                .map(|v| u64::try_from(v).map_err(|e| StoreError::Corrupt(format!("version {v}: {e}"))))
                .transpose()?;
            if !expected.matches(current) {
                return Err(StoreError::Conflict(format!(
                    "model {id} changed after it was read: expected {expected:?}, found {current:?}"
                )));
            }
        }
        ReadCheck::Type { model_type, members } => {
            let rows = sqlx::query("SELECT id, version FROM models WHERE model_type = $1 ORDER BY id")
                .bind(model_type)
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("check_type", e))?;
            let mut current = Vec::with_capacity(rows.len());
            for row in &rows {
                let id = ModelId::from_uuid(row.try_get::<Uuid, _>("id").map_err(corrupt)?);
                let version: i64 = row.try_get("version").map_err(corrupt)?;
                let version =
                    u64::try_from(version).map_err(|e| StoreError::Corrupt(format!("version {version}: {e}")))?;
                current.push((id, version));
            }
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

async fn apply_op(tx: &mut Transaction<'_, Postgres>, op: &WriteOp) -> Result<(), StoreError> {
    let affected = match op {
        WriteOp::Put { model, expected } => {
            let version = to_db_version(model.version)?;
            match expected {
                ExpectedVersion::Absent => sqlx::query(
                    r#"
                    INSERT INTO models (id, model_type, state, props, created_at, last_state_transition_at, version)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(model.id.as_uuid())
                .bind(&model.model_type)
                .bind(&model.state)
                .bind(&model.props)
                .bind(model.created_at)
                .bind(model.last_state_transition_at)
                .bind(version)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("insert_model", e))?
                .rows_affected(),
                ExpectedVersion::Exact(current) => sqlx::query(
                    r#"
                    UPDATE models
                    SET state = $2, props = $3, last_state_transition_at = $4, version = $5
                    WHERE id = $1 AND version = $6
                    "#,
                )
                .bind(model.id.as_uuid())
                .bind(&model.state)
                .bind(&model.props)
                .bind(model.last_state_transition_at)
                .bind(version)
                .bind(to_db_version(*current)?)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("update_model", e))?
                .rows_affected(),
            }
        }
        WriteOp::Delete { id, expected } => match expected {
            ExpectedVersion::Exact(current) => sqlx::query("DELETE FROM models WHERE id = $1 AND version = $2")
                .bind(id.as_uuid())
                .bind(to_db_version(*current)?)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete_model", e))?
                .rows_affected(),
            ExpectedVersion::Absent => {
                return Err(StoreError::Conflict(format!("cannot delete model {id} expected to be absent")));
            }
        },
    };

    if affected == 0 {
        return Err(StoreError::Conflict(format!(
            "model {}: version expectation did not hold",
            op.model_id()
        )));
    }
    Ok(())
}

impl ModelStore for PostgresModelStore {
    fn load(&self, id: ModelId) -> Result<Option<StoredModel>, StoreError> {
        self.block(self.load_model(id))
    }

    fn list_by_type(&self, model_type: &str) -> Result<Vec<StoredModel>, StoreError> {
        self.block(self.list_models(model_type))
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.block(self.count_models())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.block(self.commit_batch(batch))
    }

    fn token_seen(&self, token: CommandToken) -> Result<bool, StoreError> {
        self.block(self.is_token_seen(token))
    }

    fn event_log(&self) -> Result<Vec<EventLogEntry>, StoreError> {
        self.block(self.load_event_log())
    }
}

fn model_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredModel, StoreError> {
    let version: i64 = row.try_get("version").map_err(corrupt)?;
    Ok(StoredModel {
        id: ModelId::from_uuid(row.try_get::<Uuid, _>("id").map_err(corrupt)?),
        model_type: row.try_get("model_type").map_err(corrupt)?,
        state: row.try_get("state").map_err(corrupt)?,
        props: row.try_get("props").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        last_state_transition_at: row.try_get("last_state_transition_at").map_err(corrupt)?,
        version: u64::try_from(version).map_err(|e| StoreError::Corrupt(format!("version {version}: {e}")))?,
    })
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|e| StoreError::Corrupt(format!("version {version}: {e}")))
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to decode row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
