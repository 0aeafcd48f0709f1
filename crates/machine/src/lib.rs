//! `statecraft-machine` — declarative state machines for managed models.
//!
//! A model type is described once at startup by a [`StateMachine`]: its states,
//! the events legal in each state, validators, `on_enter` job hooks, time
//! triggers and cascading commands. The definition is immutable afterwards and
//! holds no storage or runtime concerns; infra executes it.

pub mod collection;
pub mod command;
pub mod event;
pub mod job;
pub mod machine;
pub mod reader;
pub mod transition;
pub mod validation;

pub use collection::Collection;
pub use command::{Command, CommandToken, ProcessingOptions};
pub use event::{EventRef, EventShape, Invocation};
pub use job::JobRequest;
pub use machine::{AtTime, DefinitionError, StateDef, StateMachine, StateMachineBuilder};
pub use reader::{ModelReader, ModelReaderExt};
pub use transition::{EventArgs, HookArgs, TransitionKind, TransitionSpec};
pub use validation::Validity;
