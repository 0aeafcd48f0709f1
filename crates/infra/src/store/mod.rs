//! Model store boundary.
//!
//! The store persists the current snapshot of every model plus the
//! processed-token set and the event log. All writes of one submission go
//! through [`ModelStore::commit`] as a single atomic [`WriteBatch`].

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryModelStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresModelStore;
pub use r#trait::{EventLogEntry, ModelStore, ReadCheck, StoreError, WriteBatch, WriteOp};
