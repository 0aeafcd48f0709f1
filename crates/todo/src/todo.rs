use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;

use statecraft_core::{Model, ModelId, ModelProps, Problem};
use statecraft_machine::{
    Collection, Command, DefinitionError, EventArgs, EventRef, HookArgs, JobRequest, StateMachine, TransitionSpec,
    Validity,
};

/// A todo item owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    pub user_id: ModelId,
}

impl ModelProps for Todo {
    const MODEL_TYPE: &'static str = "todo";
}

pub const CREATED: &str = "Created";
pub const COMPLETED: &str = "Completed";
pub const TRASHED: &str = "Trashed";

pub const CREATE_TODO: EventRef = EventRef::void("todo", "CreateTodo");
pub const MARK_COMPLETE: EventRef = EventRef::instance("todo", "MarkComplete");
pub const UNMARK_COMPLETE: EventRef = EventRef::instance("todo", "UnmarkComplete");
pub const MOVE_TO_TRASH: EventRef = EventRef::instance("todo", "MoveToTrash");
pub const RECOVER_FROM_TRASH: EventRef = EventRef::instance("todo", "RecoverFromTrash");
pub const DELETE_FROM_TRASH: EventRef = EventRef::instance("todo", "DeleteFromTrash");
pub const DELETE_TODO_INTERNAL: EventRef = EventRef::instance("todo", "DeleteTodoInternal").internal();
pub const AUTO_DELETE_TODO: EventRef = EventRef::instance("todo", "AutoDeleteTodo").internal();

/// Queued whenever a todo enters `Created`.
pub const UPDATE_USER_BILL_JOB: &str = "todo.update_user_bill";

pub const TITLE_MAX_CHARS: usize = 100;
pub const DESCRIPTION_MAX_CHARS: usize = 100_000;
pub const PRIORITY_MAX: i32 = 10;
pub const BANNED_WORDS: [&str; 2] = ["hello", "world"];

/// Minimum time between two completion status changes.
pub fn completion_rate_limit() -> Duration {
    Duration::seconds(1)
}

/// How long a trashed todo is kept before it is deleted automatically.
pub fn trash_retention() -> Duration {
    Duration::days(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTodoParams {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Name of the creating user; must match the actor.
    pub username: String,
    #[serde(default)]
    pub priority: i32,
}

impl CreateTodoParams {
    pub fn new(title: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            username: username.into(),
            priority: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn into_command(self) -> Result<Command, Problem> {
        Command::void(CREATE_TODO).with_params(&self)
    }
}

/// All todos of `user`.
pub fn todos_of(user: ModelId) -> Collection<Todo> {
    Collection::new(format!("todo.of_user.{user}"), move |t: &Model<Todo>| t.props.user_id == user)
}

// Validators of CreateTodo. Each decodes the params itself; a decoding
// failure is reported by every validator, which is acceptable for a demo.

fn params(args: &EventArgs<'_, Todo>) -> Result<CreateTodoParams, Validity> {
    args.params().map_err(|p: Problem| Validity::invalid(p.to_string()))
}

fn title_not_blank(args: &EventArgs<'_, Todo>) -> Validity {
    match params(args) {
        Ok(p) => Validity::check(!p.title.trim().is_empty(), || {
            "Title cannot contain only whitespaces".to_string()
        }),
        Err(invalid) => invalid,
    }
}

fn title_without_banned_words(args: &EventArgs<'_, Todo>) -> Validity {
    let Ok(p) = params(args) else {
        return Validity::Valid;
    };
    let lowered = p.title.to_lowercase();
    match BANNED_WORDS.iter().find(|w| lowered.contains(*w)) {
        Some(word) => Validity::invalid(format!("Title cannot contain the banned word '{word}'")),
        None => Validity::Valid,
    }
}

fn title_shape(args: &EventArgs<'_, Todo>) -> Validity {
    let Ok(p) = params(args) else {
        return Validity::Valid;
    };
    let chars = p.title.chars().count();
    if !(1..=TITLE_MAX_CHARS).contains(&chars) {
        return Validity::invalid(format!("Title must be between 1 and {TITLE_MAX_CHARS} characters"));
    }
    Validity::check(!p.title.contains('\n'), || "Title must be a single line".to_string())
}

fn description_length(args: &EventArgs<'_, Todo>) -> Validity {
    let Ok(p) = params(args) else {
        return Validity::Valid;
    };
    Validity::check(p.description.chars().count() <= DESCRIPTION_MAX_CHARS, || {
        format!("Description must be at most {DESCRIPTION_MAX_CHARS} characters")
    })
}

fn priority_range(args: &EventArgs<'_, Todo>) -> Validity {
    let Ok(p) = params(args) else {
        return Validity::Valid;
    };
    if !(0..=PRIORITY_MAX).contains(&p.priority) {
        return Validity::invalid(format!("Priority must be between 0 and {PRIORITY_MAX}"));
    }
    Validity::check(p.priority % 2 == 0, || "Only even priorities are allowed.".to_string())
}

fn completion_not_too_soon(args: &EventArgs<'_, Todo>) -> Validity {
    let Some(model) = args.model else {
        return Validity::Valid;
    };
    let limit = completion_rate_limit();
    Validity::check(args.context.time - model.last_state_transition_at >= limit, || {
        format!("You can only change the completion status every {}s.", limit.num_seconds())
    })
}

fn build_todo(args: &EventArgs<'_, Todo>) -> Result<Todo, Problem> {
    let p: CreateTodoParams = args.params()?;
    let user_id = args
        .context
        .actor
        .model_id()
        .ok_or_else(|| Problem::unauthorized("todos can only be created by a user"))?;
    Ok(Todo {
        title: p.title,
        description: p.description,
        priority: p.priority,
        user_id,
    })
}

fn update_user_bill(args: &HookArgs<'_, Todo>) -> Vec<JobRequest> {
    vec![JobRequest::new(
        UPDATE_USER_BILL_JOB,
        json!({ "user_id": args.model.props.user_id, "todo_id": args.model.id }),
    )]
}

pub fn state_machine() -> Result<StateMachine<Todo>, DefinitionError> {
    StateMachine::builder()
        .states(&[CREATED, COMPLETED, TRASHED])
        .event(CREATE_TODO, |e| {
            e.validate(title_not_blank)
                .validate(title_without_banned_words)
                .validate(title_shape)
                .validate(description_length)
                .validate(priority_range)
        })
        .event(MARK_COMPLETE, |e| e.validate(completion_not_too_soon))
        .event(UNMARK_COMPLETE, |e| e.validate(completion_not_too_soon))
        .event(MOVE_TO_TRASH, |e| e)
        .event(RECOVER_FROM_TRASH, |e| e)
        .event(DELETE_FROM_TRASH, |e| e)
        .event(DELETE_TODO_INTERNAL, |e| e)
        .event(AUTO_DELETE_TODO, |e| e)
        .void_state(|s| s.on_event(CREATE_TODO, TransitionSpec::create_model(CREATED, build_todo)))
        .state(CREATED, |s| {
            s.on_enter(update_user_bill)
                .on_event(MOVE_TO_TRASH, TransitionSpec::transition_to(TRASHED))
                .on_event(MARK_COMPLETE, TransitionSpec::transition_to(COMPLETED))
                .on_event(DELETE_TODO_INTERNAL, TransitionSpec::delete())
        })
        .state(COMPLETED, |s| {
            s.on_event(MOVE_TO_TRASH, TransitionSpec::transition_to(TRASHED))
                .on_event(UNMARK_COMPLETE, TransitionSpec::transition_to(CREATED))
                .on_event(DELETE_TODO_INTERNAL, TransitionSpec::delete())
        })
        .state(TRASHED, |s| {
            s.on_event(RECOVER_FROM_TRASH, TransitionSpec::transition_to(CREATED))
                .on_event(DELETE_FROM_TRASH, TransitionSpec::delete())
                .on_event(DELETE_TODO_INTERNAL, TransitionSpec::delete())
                .on_event(AUTO_DELETE_TODO, TransitionSpec::delete())
                .at_time(AUTO_DELETE_TODO, |m| m.last_state_transition_at + trash_retention())
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use statecraft_core::{ActorIdentity, Context, Model, StoredModel};
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

    fn validate_create(params: &CreateTodoParams) -> Vec<String> {
        let machine = state_machine().unwrap();
        let context = Context::new(ActorIdentity::authenticated(ModelId::new(), ["users"]));
        let command = params.clone().into_command().unwrap();
        machine.validate(&EventArgs {
            context: &context,
            command: &command,
            model: None,
            reader: &Empty,
        })
    }

    fn todo_in(state: &str, last_transition: chrono::DateTime<Utc>) -> Model<Todo> {
        Model {
            id: ModelId::new(),
            state: state.to_string(),
            props: Todo {
                title: "t".into(),
                description: String::new(),
                priority: 0,
                user_id: ModelId::new(),
            },
            created_at: last_transition,
            last_state_transition_at: last_transition,
            version: 1,
        }
    }

    #[test]
    fn machine_builds_with_expected_events() {
        let machine = state_machine().unwrap();
        assert_eq!(
            machine.external_events(Some(CREATED)),
            vec![MARK_COMPLETE, MOVE_TO_TRASH]
        );
        assert_eq!(
            machine.external_events(Some(TRASHED)),
            vec![DELETE_FROM_TRASH, RECOVER_FROM_TRASH]
        );
        assert_eq!(machine.timed_states(), vec![TRASHED]);
    }

    #[test]
    fn well_formed_todo_passes() {
        let params = CreateTodoParams::new("Buy milk", "Alice")
            .with_description("two liters")
            .with_priority(4);
        assert!(validate_create(&params).is_empty());
    }

    #[test]
    fn every_title_failure_is_reported() {
        let failures = validate_create(&CreateTodoParams::new("   ", "Alice"));
        assert_eq!(failures, vec!["Title cannot contain only whitespaces".to_string()]);

        let failures = validate_create(&CreateTodoParams::new("Hello\nWorld", "Alice"));
        assert_eq!(
            failures,
            vec![
                "Title cannot contain the banned word 'hello'".to_string(),
                "Title must be a single line".to_string(),
            ]
        );

        let failures = validate_create(&CreateTodoParams::new("x".repeat(101), "Alice"));
        assert_eq!(failures, vec!["Title must be between 1 and 100 characters".to_string()]);
    }

    #[test]
    fn priority_must_be_even_and_in_range() {
        let odd = CreateTodoParams::new("a", "Alice").with_priority(3);
        assert_eq!(validate_create(&odd), vec!["Only even priorities are allowed.".to_string()]);
        let high = CreateTodoParams::new("a", "Alice").with_priority(12);
        assert_eq!(validate_create(&high), vec!["Priority must be between 0 and 10".to_string()]);
    }

    #[test]
    fn long_descriptions_are_rejected() {
        let params = CreateTodoParams::new("a", "Alice").with_description("d".repeat(DESCRIPTION_MAX_CHARS + 1));
        assert_eq!(validate_create(&params).len(), 1);
    }

    #[test]
    fn completion_status_is_rate_limited() {
        let machine = state_machine().unwrap();
        let t0 = Utc::now();
        let model = todo_in(COMPLETED, t0);
        let command = Command::instance(UNMARK_COMPLETE, model.id);

        let check = |at| {
            let context = Context::system().at(at);
            machine.validate(&EventArgs {
                context: &context,
                command: &command,
                model: Some(&model),
                reader: &Empty,
            })
        };
        assert_eq!(
            check(t0 + Duration::milliseconds(500)),
            vec!["You can only change the completion status every 1s.".to_string()]
        );
        assert!(check(t0 + Duration::seconds(1)).is_empty());
    }

    #[test]
    fn trashed_todos_expire_after_a_day() {
        let machine = state_machine().unwrap();
        let t0 = Utc::now();
        let model = todo_in(TRASHED, t0);
        let trigger = &machine.time_triggers(TRASHED)[0];
        assert_eq!(trigger.event, AUTO_DELETE_TODO);
        assert_eq!(trigger.due_at(&model), t0 + Duration::days(1));
    }

    #[test]
    fn entering_created_queues_billing_job() {
        let machine = state_machine().unwrap();
        let model = todo_in(CREATED, Utc::now());
        let context = Context::system();
        let jobs = machine.on_enter_jobs(&HookArgs {
            context: &context,
            model: &model,
            reader: &Empty,
        });
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, UPDATE_USER_BILL_JOB);
        assert!(machine.on_enter_jobs(&HookArgs {
            context: &context,
            model: &todo_in(COMPLETED, Utc::now()),
            reader: &Empty,
        })
        .is_empty());
    }

    #[test]
    fn todos_of_selects_by_owner() {
        let mine = todo_in(CREATED, Utc::now());
        let theirs = todo_in(CREATED, Utc::now());
        let collection = todos_of(mine.props.user_id);
        assert!(collection.contains(&mine));
        assert!(!collection.contains(&theirs));
    }

    proptest! {
        #[test]
        fn priority_is_accepted_iff_even_and_in_range(priority in -20i32..20) {
            let params = CreateTodoParams::new("a", "Alice").with_priority(priority);
            let accepted = validate_create(&params).is_empty();
            prop_assert_eq!(accepted, (0..=10).contains(&priority) && priority % 2 == 0);
        }
    }
}
