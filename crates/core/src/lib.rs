//! `statecraft-core` — foundation types shared by every engine layer.
//!
//! This crate contains **pure** primitives (no storage, no threads): identifiers,
//! the problem taxonomy, the per-call context and the model representation.

pub mod context;
pub mod error;
pub mod id;
pub mod model;
pub mod version;

pub use context::{ActorIdentity, Context};
pub use error::{Problem, ProblemResult};
pub use id::{JobId, ModelId};
pub use model::{Model, ModelProps, StoredModel};
pub use version::ExpectedVersion;
