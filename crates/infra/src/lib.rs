//! `statecraft-infra` — runtime of the state-machine engine.
//!
//! - `store`: persistence contract, in-memory and Postgres implementations
//! - `processor`: command pipeline (legality, validation, authorization, commit)
//! - `read`: authorized read facade
//! - `scheduler`: time-triggered transitions
//! - `jobs`: job queue, executor, retries and dead letters
//! - `engine`: composition root wiring all of the above

pub mod config;
pub mod engine;
pub mod jobs;
pub mod locks;
pub mod processor;
pub mod read;
pub mod registration;
pub mod scheduler;
pub mod store;
pub mod unit_of_work;

#[cfg(test)]
mod integration_tests;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineError};
pub use processor::{CascadeFailure, CommandResult, Failure, Origin, Success};
pub use read::ReadView;
pub use registration::{ManagedModel, ModelRegistration};
pub use scheduler::TickReport;
pub use store::{EventLogEntry, InMemoryModelStore, ModelStore, ReadCheck, StoreError, WriteBatch, WriteOp};

#[cfg(feature = "postgres")]
pub use store::PostgresModelStore;
