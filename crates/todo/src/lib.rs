//! Todo demo domain.
//!
//! Two managed model types, [`Todo`] and [`User`], their state machines and
//! the authorization rules of the todo application. Pure definitions: no
//! storage, no threads. Hosts register them with the engine:
//!
//! ```ignore
//! let engine = EngineBuilder::new(InMemoryModelStore::new())
//!     .model(ModelRegistration::new(statecraft_todo::todo::state_machine()?))
//!     .model(ModelRegistration::new(statecraft_todo::user::state_machine()?))
//!     .authorization(statecraft_todo::rules::authorization_rules())
//!     .build()?;
//! ```

pub mod rules;
pub mod todo;
pub mod user;

pub use rules::{ADMINS_GROUP, GUESTS_GROUP, USERS_GROUP, authorization_rules};
pub use todo::{CreateTodoParams, Todo, UPDATE_USER_BILL_JOB};
pub use user::{CreateUserParams, User};
