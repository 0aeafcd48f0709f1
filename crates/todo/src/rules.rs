//! Authorization rules of the todo application.
//!
//! Actors are either the system identity (acting for the identity provider
//! and the engine), unauthenticated visitors, or users authenticated with
//! groups from the identity provider (`users`, `guests`, `admins`).

use statecraft_auth::{
    AuthorizationRules, Category, NegativeAuthorization, PositiveAuthorization, RuleArgs,
};
use statecraft_core::{ActorIdentity, ModelId, ModelProps, StoredModel};
use statecraft_machine::ModelReaderExt;

use crate::todo::{self, CREATE_TODO, CreateTodoParams, DELETE_TODO_INTERNAL, Todo};
use crate::user::{CREATE_USER, User};

use statecraft_auth::NegativeAuthorization::{Deny, Pass};
use statecraft_auth::PositiveAuthorization::{Allow, NoOpinion};

pub const USERS_GROUP: &str = "users";
pub const ADMINS_GROUP: &str = "admins";
pub const GUESTS_GROUP: &str = "guests";

pub const GUEST_LIMIT_REASON: &str = "You can only create one TODO as guest. Please buy premium.";

fn allow_if(condition: bool) -> PositiveAuthorization {
    if condition { Allow } else { NoOpinion }
}

fn is_user(model: &StoredModel) -> bool {
    model.is_of::<User>()
}

pub fn is_todo(model: &StoredModel) -> bool {
    model.model_type == Todo::MODEL_TYPE
}

fn todo_owner(model: &StoredModel) -> Option<ModelId> {
    if !is_todo(model) {
        return None;
    }
    model.decode::<Todo>().ok().map(|t| t.props.user_id)
}

fn actor_owns(args: &RuleArgs<'_>, model: &StoredModel) -> bool {
    let actor = args.context.actor.model_id();
    actor.is_some() && todo_owner(model) == actor
}

fn is_admin(actor: &ActorIdentity) -> bool {
    actor.in_group(ADMINS_GROUP)
}

// ── commands ────────────────────────────────────────────────────────────────

fn user_can_create_own_todos(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let actor = &args.context.actor;
    let (Some(command), Some(actor_id)) = (args.command(), actor.model_id()) else {
        return NoOpinion;
    };
    if *command.event() != CREATE_TODO || !(actor.in_group(USERS_GROUP) || actor.in_group(GUESTS_GROUP)) {
        return NoOpinion;
    }
    let Ok(params) = command.params::<CreateTodoParams>() else {
        return NoOpinion;
    };
    let Ok(user) = args.reader.get::<User>(actor_id) else {
        return NoOpinion;
    };
    allow_if(params.username == user.props.name)
}

fn user_can_modify_own_todos(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let (Some(command), Some(actor_id)) = (args.command(), args.context.actor.model_id()) else {
        return NoOpinion;
    };
    let Some(target) = command.model() else {
        return NoOpinion;
    };
    match args.reader.get::<Todo>(target) {
        Ok(todo) => allow_if(todo.props.user_id == actor_id),
        Err(_) => NoOpinion,
    }
}

/// The identity provider runs as the system identity and manages users.
fn system_can_modify_users(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let Some(command) = args.command() else {
        return NoOpinion;
    };
    if !args.context.actor.is_system() {
        return NoOpinion;
    }
    if *command.event() == CREATE_USER {
        return Allow;
    }
    match command.model() {
        Some(id) => allow_if(args.reader.get::<User>(id).is_ok()),
        None => NoOpinion,
    }
}

fn system_can_delete_todos(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let Some(command) = args.command() else {
        return NoOpinion;
    };
    allow_if(
        args.context.actor.is_system() && command.model().is_some() && *command.event() == DELETE_TODO_INTERNAL,
    )
}

fn guests_can_only_create_one_todo(args: &RuleArgs<'_>) -> NegativeAuthorization {
    let actor = &args.context.actor;
    let (Some(command), Some(actor_id)) = (args.command(), actor.model_id()) else {
        return Pass;
    };
    if *command.event() != CREATE_TODO || !actor.in_group(GUESTS_GROUP) || actor.in_group(USERS_GROUP) {
        return Pass;
    }
    match args.reader.list(&todo::todos_of(actor_id)) {
        Ok(existing) if existing.is_empty() => Pass,
        Ok(_) => Deny,
        Err(problem) => {
            tracing::warn!(guest = %actor_id, %problem, "could not count guest todos; denying");
            Deny
        }
    }
}

// ── model and property reads ────────────────────────────────────────────────

fn unauthenticated_can_read_users(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let Some(model) = args.model() else {
        return NoOpinion;
    };
    allow_if(args.context.actor == ActorIdentity::Unauthenticated && is_user(model))
}

fn system_can_read_users(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let Some(model) = args.model() else {
        return NoOpinion;
    };
    allow_if(args.context.actor.is_system() && is_user(model))
}

fn user_can_read_own_todos(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let Some(model) = args.model() else {
        return NoOpinion;
    };
    allow_if(actor_owns(args, model))
}

fn user_can_read_own_user(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let Some(model) = args.model() else {
        return NoOpinion;
    };
    allow_if(is_user(model) && args.context.actor.model_id() == Some(model.id))
}

fn admins_can_read_everything(args: &RuleArgs<'_>) -> PositiveAuthorization {
    let Some(model) = args.model() else {
        return NoOpinion;
    };
    allow_if(is_admin(&args.context.actor) && (is_user(model) || is_todo(model)))
}

pub fn authorization_rules() -> AuthorizationRules {
    let mut builder = AuthorizationRules::builder()
        .positive(Category::Commands, "user can create own todos", user_can_create_own_todos)
        .positive(Category::Commands, "user can modify own todos", user_can_modify_own_todos)
        .positive(Category::Commands, "system can modify users", system_can_modify_users)
        .positive(Category::Commands, "system can delete todos", system_can_delete_todos)
        .negative(
            Category::Commands,
            "guests can only create one todo",
            GUEST_LIMIT_REASON,
            guests_can_only_create_one_todo,
        );

    // Property reads follow the same rules as model reads.
    for category in [Category::ReadModels, Category::ReadProperties] {
        builder = builder
            .positive(category, "unauthenticated can read users", unauthenticated_can_read_users)
            .positive(category, "system can read users", system_can_read_users)
            .positive(category, "user can read own todos", user_can_read_own_todos)
            .positive(category, "user can read own user", user_can_read_own_user)
            .positive(category, "admins can read all todos and users", admins_can_read_everything);
    }

    builder
        .positive(Category::EventLog, "everybody can read the event log", |_| Allow)
        .build()
}
