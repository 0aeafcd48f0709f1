use serde::{Deserialize, Serialize};

use statecraft_core::{ModelId, ModelProps, Problem};
use statecraft_machine::{
    Command, DefinitionError, EventArgs, EventRef, ModelReaderExt, StateMachine, TransitionSpec, Validity,
};

use crate::todo::{self, DELETE_TODO_INTERNAL};

/// A user of the todo application. Groups come from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
}

impl ModelProps for User {
    const MODEL_TYPE: &'static str = "user";
}

pub const CREATED: &str = "Created";

pub const CREATE_USER: EventRef = EventRef::void("user", "CreateUser");
/// Deletes the user after deleting all of their todos.
pub const DELETE_USER: EventRef = EventRef::instance("user", "DeleteUser");
pub const DELETE_ALL_USER_TODOS: EventRef = EventRef::instance("user", "DeleteAllUserTodos").internal();

pub const NAME_MIN_CHARS: usize = 3;
pub const NAME_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserParams {
    pub name: String,
}

impl CreateUserParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

pub fn create_user(name: &str) -> Result<Command, Problem> {
    Command::void(CREATE_USER).with_params(&CreateUserParams::new(name))
}

pub fn delete_user(id: ModelId) -> Command {
    Command::instance(DELETE_USER, id)
}

fn name_is_valid(args: &EventArgs<'_, User>) -> Validity {
    let params: CreateUserParams = match args.params() {
        Ok(p) => p,
        Err(problem) => return Validity::invalid(problem.to_string()),
    };
    let chars = params.name.chars().count();
    if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&chars) {
        return Validity::invalid(format!(
            "Name must be between {NAME_MIN_CHARS} and {NAME_MAX_CHARS} characters"
        ));
    }
    Validity::check(!params.name.contains('\n'), || "Name must be a single line".to_string())
}

fn build_user(args: &EventArgs<'_, User>) -> Result<User, Problem> {
    let params: CreateUserParams = args.params()?;
    Ok(User { name: params.name })
}

fn delete_todos_of_user(args: &EventArgs<'_, User>) -> Result<Vec<Command>, Problem> {
    let user = args.model()?;
    let todos = args.reader.list(&todo::todos_of(user.id))?;
    Ok(todos
        .into_iter()
        .map(|t| Command::instance(DELETE_TODO_INTERNAL, t.id))
        .collect())
}

pub fn state_machine() -> Result<StateMachine<User>, DefinitionError> {
    StateMachine::builder()
        .states(&[CREATED])
        .event(CREATE_USER, |e| e.validate(name_is_valid))
        .event(DELETE_USER, |e| e)
        .event(DELETE_ALL_USER_TODOS, |e| e)
        .void_state(|s| s.on_event(CREATE_USER, TransitionSpec::create_model(CREATED, build_user)))
        .state(CREATED, |s| {
            s.on_event(DELETE_ALL_USER_TODOS, TransitionSpec::create_commands(delete_todos_of_user))
                .on_event(DELETE_USER, TransitionSpec::delete().with_cascade(delete_todos_of_user))
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use statecraft_core::{Context, StoredModel};
    use statecraft_machine::ModelReader;

    struct Empty;

    impl ModelReader for Empty {
        fn get_stored(&self, _id: ModelId) -> Result<StoredModel, Problem> {
            Err(Problem::NotFound)
        }

        fn list_stored(&self, _model_type: &str) -> Result<Vec<StoredModel>, Problem> {
            Ok(Vec::new())
        }
    }

    fn validate(name: &str) -> Vec<String> {
        let machine = state_machine().unwrap();
        let context = Context::system();
        let command = create_user(name).unwrap();
        machine.validate(&EventArgs {
            context: &context,
            command: &command,
            model: None,
            reader: &Empty,
        })
    }

    #[test]
    fn machine_builds() {
        let machine = state_machine().unwrap();
        assert!(machine.is_event_legal(None, &CREATE_USER));
        assert!(machine.is_event_legal(Some(CREATED), &DELETE_USER));
        assert_eq!(machine.external_events(Some(CREATED)), vec![DELETE_USER]);
    }

    #[test]
    fn name_length_is_bounded() {
        assert!(validate("Alice").is_empty());
        assert_eq!(validate("Al"), vec!["Name must be between 3 and 50 characters".to_string()]);
        assert_eq!(validate(&"x".repeat(51)).len(), 1);
        assert_eq!(validate("Al\nice"), vec!["Name must be a single line".to_string()]);
    }
}
