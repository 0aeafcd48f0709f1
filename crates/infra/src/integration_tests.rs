//! Integration tests for the full command pipeline, using the todo domain.
//!
//! Tests: Command → Processor → Store → Read facade / Scheduler / Jobs
//!
//! Verifies:
//! - the four todo scenarios (create, rate limit, trash expiry, guest limit)
//! - cascades, idempotency and dry-run purity
//! - read filtering per actor
//! - per-model serialization of concurrent submissions

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;

    use statecraft_core::{ActorIdentity, Context, ModelId, Problem};
    use statecraft_machine::{Collection, Command, CommandToken, ProcessingOptions};
    use statecraft_todo::rules::GUEST_LIMIT_REASON;
    use statecraft_todo::todo::{self, CreateTodoParams, Todo};
    use statecraft_todo::user::{self, User};
    use statecraft_todo::{ADMINS_GROUP, GUESTS_GROUP, USERS_GROUP};

    use crate::engine::{Engine, EngineBuilder};
    use crate::jobs::{JobResult, JobStore};
    use crate::processor::CommandResult;
    use crate::registration::ModelRegistration;
    use crate::store::{InMemoryModelStore, ModelStore};

    struct App {
        engine: Engine<InMemoryModelStore>,
        billed: Arc<AtomicUsize>,
        t0: DateTime<Utc>,
        alice: ModelId,
        bob: ModelId,
        gus: ModelId,
        root: ModelId,
    }

    fn setup() -> anyhow::Result<App> {
        let billed = Arc::new(AtomicUsize::new(0));
        let counter = billed.clone();
        let engine = EngineBuilder::new(InMemoryModelStore::new())
            .model(ModelRegistration::new(todo::state_machine()?))
            .model(ModelRegistration::new(user::state_machine()?))
            .authorization(statecraft_todo::authorization_rules())
            .job_handler("todo.*", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                JobResult::Success
            })
            .build()?;
        engine.start()?;

        let t0 = Utc::now();
        let create_user = |name: &str| -> anyhow::Result<ModelId> {
            let ok = engine
                .submit(&user::create_user(name)?, &Context::system().at(t0), ProcessingOptions::default())
                .map_err(|f| anyhow::anyhow!("{f}"))?;
            ok.primary_model_id.ok_or_else(|| anyhow::anyhow!("no model id"))
        };
        let alice = create_user("Alice")?;
        let bob = create_user("Bob")?;
        let gus = create_user("Gus")?;
        let root = create_user("Root")?;

        Ok(App {
            engine,
            billed,
            t0,
            alice,
            bob,
            gus,
            root,
        })
    }

    impl App {
        fn as_user(&self, id: ModelId, group: &str, at: DateTime<Utc>) -> Context {
            Context::new(ActorIdentity::authenticated(id, [group])).at(at)
        }

        fn alice_at(&self, offset: Duration) -> Context {
            self.as_user(self.alice, USERS_GROUP, self.t0 + offset)
        }

        fn submit(&self, command: &Command, context: &Context) -> CommandResult {
            self.engine.submit(command, context, ProcessingOptions::default())
        }

        fn create_todo(&self, context: &Context, params: CreateTodoParams) -> CommandResult {
            self.submit(&params.into_command().unwrap(), context)
        }

        fn alice_todo(&self, title: &str) -> ModelId {
            self.create_todo(&self.alice_at(Duration::zero()), CreateTodoParams::new(title, "Alice"))
                .unwrap()
                .primary_model_id
                .unwrap()
        }

        fn todo_as_alice(&self, id: ModelId) -> Result<statecraft_core::Model<Todo>, Problem> {
            self.engine
                .read(&self.alice_at(Duration::zero()), |view| view.get::<Todo>(id))
        }
    }

    #[test]
    fn scenario_a_create_todo() {
        let app = setup().unwrap();
        let ctx = app.alice_at(Duration::zero());

        let ok = app
            .create_todo(&ctx, CreateTodoParams::new("Buy milk", "Alice").with_priority(2))
            .unwrap();
        let id = ok.primary_model_id.unwrap();
        assert_eq!(ok.created_model_ids, vec![id]);
        assert_eq!(ok.jobs.len(), 1);

        let todo = app.todo_as_alice(id).unwrap();
        assert_eq!(todo.state, todo::CREATED);
        assert_eq!(todo.props.title, "Buy milk");
        assert_eq!(todo.props.user_id, app.alice);
        assert_eq!(todo.created_at, app.t0);
        assert_eq!(todo.last_state_transition_at, app.t0);

        let log = app.engine.read(&ctx, |view| view.event_log()).unwrap();
        let last = log.last().unwrap();
        assert_eq!(last.event, "todo.CreateTodo");
        assert_eq!(last.model_id, Some(id));
        assert_eq!(last.time, app.t0);
    }

    #[test]
    fn scenario_b_completion_rate_limit() {
        let app = setup().unwrap();
        let id = app.alice_todo("Walk the dog");
        let complete = Command::instance(todo::MARK_COMPLETE, id);
        let uncomplete = Command::instance(todo::UNMARK_COMPLETE, id);

        // Right after creation the status cannot change yet.
        let err = app.submit(&complete, &app.alice_at(Duration::milliseconds(200))).unwrap_err();
        assert!(matches!(err.problem, Problem::InvalidParameters(_)));

        app.submit(&complete, &app.alice_at(Duration::seconds(2))).unwrap();

        let err = app
            .submit(&uncomplete, &app.alice_at(Duration::milliseconds(2500)))
            .unwrap_err();
        assert_eq!(
            err.problem,
            Problem::InvalidParameters(vec!["You can only change the completion status every 1s.".into()])
        );

        let err = app.submit(&complete, &app.alice_at(Duration::seconds(5))).unwrap_err();
        assert_eq!(err.problem, Problem::illegal_transition(todo::COMPLETED, "MarkComplete"));

        let ok = app.submit(&uncomplete, &app.alice_at(Duration::seconds(5))).unwrap();
        // Re-entering Created bills again.
        assert_eq!(ok.jobs.len(), 1);
        assert_eq!(app.todo_as_alice(id).unwrap().state, todo::CREATED);
    }

    #[test]
    fn scenario_c_trashed_todo_expires() {
        let app = setup().unwrap();
        let id = app.alice_todo("Old idea");
        let trashed_at = Duration::seconds(10);
        app.submit(&Command::instance(todo::MOVE_TO_TRASH, id), &app.alice_at(trashed_at))
            .unwrap();

        let report = app.engine.tick(app.t0 + trashed_at + Duration::hours(23));
        assert_eq!(report.fired, 0);
        assert!(app.todo_as_alice(id).is_ok());

        let report = app.engine.tick(app.t0 + trashed_at + Duration::days(1));
        assert_eq!(report.fired, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(app.todo_as_alice(id).unwrap_err(), Problem::NotFound);

        let log = app.engine.store().event_log().unwrap();
        let last = log.last().unwrap();
        assert_eq!(last.event, "todo.AutoDeleteTodo");
        assert_eq!(last.actor, "system");
    }

    #[test]
    fn scenario_d_guest_limit() {
        let app = setup().unwrap();
        app.alice_todo("not for guests");
        let guest = app.as_user(app.gus, GUESTS_GROUP, app.t0);

        app.create_todo(&guest, CreateTodoParams::new("first", "Gus")).unwrap();
        let err = app
            .create_todo(&guest, CreateTodoParams::new("second", "Gus"))
            .unwrap_err();
        assert_eq!(err.problem, Problem::unauthorized(GUEST_LIMIT_REASON));

        let todos = app.engine.read(&guest, |view| view.list(&Collection::<Todo>::all()));
        assert!(matches!(todos, Err(Problem::Unauthorized(_))));
        let visible = app
            .engine
            .read(&guest, |view| view.list_if_authorized(&Collection::<Todo>::all()))
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].props.user_id, app.gus);
    }

    #[test]
    fn racing_guest_submissions_still_get_one_todo() {
        let app = setup().unwrap();
        let guest = app.as_user(app.gus, GUESTS_GROUP, app.t0);
        let commands: Vec<Command> = (0..6)
            .map(|i| CreateTodoParams::new(format!("try {i}"), "Gus").into_command().unwrap())
            .collect();

        let results: Vec<CommandResult> = std::thread::scope(|s| {
            let handles: Vec<_> = commands
                .iter()
                .map(|command| s.spawn(|| app.submit(command, &guest)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for rejected in results.iter().filter_map(|r| r.as_ref().err()) {
            assert_eq!(rejected.problem, Problem::unauthorized(GUEST_LIMIT_REASON));
        }
        let todos = app.engine.store().list_by_type("todo").unwrap();
        assert_eq!(todos.len(), 1);
    }

    #[test]
    fn invalid_todos_change_nothing() {
        let app = setup().unwrap();
        let before = app.engine.models_count().unwrap();

        let err = app
            .create_todo(&app.alice_at(Duration::zero()), CreateTodoParams::new("hello there", "Alice").with_priority(3))
            .unwrap_err();
        assert_eq!(
            err.problem,
            Problem::InvalidParameters(vec![
                "Title cannot contain the banned word 'hello'".into(),
                "Only even priorities are allowed.".into(),
            ])
        );
        assert_eq!(app.engine.models_count().unwrap(), before);
        assert_eq!(app.engine.job_store().stats().unwrap().pending, 0);
    }

    #[test]
    fn users_act_only_on_their_own_todos() {
        let app = setup().unwrap();
        let id = app.alice_todo("Secret plan");
        let bob = app.as_user(app.bob, USERS_GROUP, app.t0 + Duration::seconds(5));

        let err = app.submit(&Command::instance(todo::MOVE_TO_TRASH, id), &bob).unwrap_err();
        assert_eq!(err.problem, Problem::unauthorized("no rule granted access"));

        // Creating in somebody else's name is refused as well.
        let err = app.create_todo(&bob, CreateTodoParams::new("x", "Alice")).unwrap_err();
        assert!(matches!(err.problem, Problem::Unauthorized(_)));

        // Internal events are never accepted from outside.
        let err = app
            .submit(&Command::instance(todo::DELETE_TODO_INTERNAL, id), &Context::system())
            .unwrap_err();
        assert!(matches!(err.problem, Problem::Unauthorized(_)));
        assert!(app.todo_as_alice(id).is_ok());
    }

    #[test]
    fn deleting_a_user_deletes_their_todos() {
        let app = setup().unwrap();
        let first = app.alice_todo("one");
        let second = app.alice_todo("two");
        let ctx = app.as_user(app.bob, USERS_GROUP, app.t0);
        let bobs = app
            .create_todo(&ctx, CreateTodoParams::new("bob's", "Bob"))
            .unwrap()
            .primary_model_id
            .unwrap();

        let ok = app
            .submit(&user::delete_user(app.alice), &Context::system())
            .unwrap();
        assert!(ok.cascade_failures.is_empty());
        let mut deleted = ok.deleted_model_ids.clone();
        deleted.sort();
        let mut expected = vec![app.alice, first, second];
        expected.sort();
        assert_eq!(deleted, expected);

        let store = app.engine.store();
        assert_eq!(store.load(first).unwrap(), None);
        assert_eq!(store.load(app.alice).unwrap(), None);
        assert!(store.load(bobs).unwrap().is_some());

        let log = store.event_log().unwrap();
        let cascaded = log.iter().filter(|e| e.event == "todo.DeleteTodoInternal").count();
        assert_eq!(cascaded, 2);
    }

    #[test]
    fn reads_are_filtered_per_actor() {
        let app = setup().unwrap();
        let id = app.alice_todo("Alice's");
        let all = Collection::<Todo>::all();

        let bob = app.as_user(app.bob, USERS_GROUP, app.t0);
        app.engine.read(&bob, |view| {
            assert_eq!(view.get::<Todo>(id).unwrap_err(), Problem::unauthorized("no rule granted access"));
            assert!(view.list_if_authorized(&all).unwrap().is_empty());
            assert!(view.view(id).is_err());
            // Bob sees himself but not Alice.
            assert!(view.get::<User>(app.bob).is_ok());
            assert!(view.get::<User>(app.alice).is_err());
        });

        let admin = app.as_user(app.root, ADMINS_GROUP, app.t0);
        app.engine.read(&admin, |view| {
            assert_eq!(view.list(&all).unwrap().len(), 1);
            let json = view.view(id).unwrap();
            assert_eq!(json["props"]["title"], "Alice's");
            assert_eq!(view.list_views(&Collection::<User>::all()).unwrap().len(), 4);
        });

        let visitor = Context::unauthenticated();
        app.engine.read(&visitor, |view| {
            assert_eq!(view.list(&Collection::<User>::all()).unwrap().len(), 4);
            assert!(view.list(&all).is_err());
            let alice = view
                .get_first_where(&Collection::<User>::all(), |u| u.props.name == "Alice")
                .unwrap();
            assert_eq!(alice.id, app.alice);
        });

        let alice = app.alice_at(Duration::zero());
        let events = app.engine.read(&alice, |view| view.possible_events(id)).unwrap();
        assert_eq!(events, vec![todo::MARK_COMPLETE, todo::MOVE_TO_TRASH]);
    }

    #[test]
    fn jobs_run_after_commit() {
        let app = setup().unwrap();
        app.alice_todo("a");
        app.alice_todo("b");
        assert_eq!(app.billed.load(Ordering::SeqCst), 0);

        assert_eq!(app.engine.run_pending_jobs(), 2);
        assert_eq!(app.billed.load(Ordering::SeqCst), 2);
        assert_eq!(app.engine.run_pending_jobs(), 0);
    }

    #[test]
    fn concurrent_submissions_on_one_model_are_serialized() {
        let app = setup().unwrap();
        let id = app.alice_todo("contended");
        let ctx = app.alice_at(Duration::seconds(2));
        let complete = Command::instance(todo::MARK_COMPLETE, id);

        let results: Vec<CommandResult> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| app.submit(&complete, &ctx))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 1);
        for rejected in results.iter().filter_map(|r| r.as_ref().err()) {
            assert_eq!(rejected.problem, Problem::illegal_transition(todo::COMPLETED, "MarkComplete"));
        }
        let todo = app.todo_as_alice(id).unwrap();
        assert_eq!(todo.version, 2);
    }

    #[derive(Debug, Clone)]
    enum LegalCommand {
        Create { title: String, priority: i32 },
        Complete,
        Trash,
        Recover,
    }

    fn legal_command() -> impl Strategy<Value = LegalCommand> {
        prop_oneof![
            ("[a-g]{1,12}", 0i32..=5).prop_map(|(title, half)| LegalCommand::Create { title, priority: half * 2 }),
            Just(LegalCommand::Complete),
            Just(LegalCommand::Trash),
            Just(LegalCommand::Recover),
        ]
    }

    impl App {
        /// Build `legal` against a fresh todo of Alice's, staging whatever it needs first.
        fn legal(&self, legal: &LegalCommand) -> Command {
            let target = self.alice_todo("target");
            match legal {
                LegalCommand::Create { title, priority } => CreateTodoParams::new(title.clone(), "Alice")
                    .with_priority(*priority)
                    .into_command()
                    .unwrap(),
                LegalCommand::Complete => Command::instance(todo::MARK_COMPLETE, target),
                LegalCommand::Trash => Command::instance(todo::MOVE_TO_TRASH, target),
                LegalCommand::Recover => {
                    self.submit(&Command::instance(todo::MOVE_TO_TRASH, target), &self.alice_at(Duration::seconds(5)))
                        .unwrap();
                    Command::instance(todo::RECOVER_FROM_TRASH, target)
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn replayed_token_changes_nothing(legal in legal_command()) {
            let app = setup().unwrap();
            let command = app.legal(&legal);
            let ctx = app.alice_at(Duration::seconds(10));
            let options = ProcessingOptions::new(CommandToken::simple());

            let first = app.engine.submit(&command, &ctx, options).unwrap();
            let id = first.primary_model_id.unwrap();
            let store = app.engine.store();
            let version = store.load(id).unwrap().map(|m| m.version);
            let models = store.count().unwrap();
            let log_len = store.event_log().unwrap().len();
            let jobs = app.engine.job_store().stats().unwrap();

            let replay = app.engine.submit(&command, &ctx, options).unwrap_err();
            prop_assert!(
                matches!(replay.problem, Problem::ConcurrentModification(_)),
                "replay gave {:?}",
                replay.problem
            );
            prop_assert_eq!(store.load(id).unwrap().map(|m| m.version), version);
            prop_assert_eq!(store.count().unwrap(), models);
            prop_assert_eq!(store.event_log().unwrap().len(), log_len);
            prop_assert_eq!(app.engine.job_store().stats().unwrap(), jobs);
        }

        #[test]
        fn dry_run_is_pure_and_predicts_the_outcome(
            title in "[a-z ]{0,12}",
            priority in -2i32..12,
        ) {
            let app = setup().unwrap();
            let ctx = app.alice_at(Duration::zero());
            let command = CreateTodoParams::new(title, "Alice")
                .with_priority(priority)
                .into_command()
                .unwrap();

            let models_before = app.engine.models_count().unwrap();
            let log_before = app.engine.store().event_log().unwrap().len();

            let dry = app
                .engine
                .submit(&command, &ctx, ProcessingOptions::dry_run(CommandToken::simple()));
            prop_assert_eq!(app.engine.models_count().unwrap(), models_before);
            prop_assert_eq!(app.engine.store().event_log().unwrap().len(), log_before);
            prop_assert_eq!(app.engine.job_store().stats().unwrap().pending, 0);

            let real = app.submit(&command, &ctx);
            prop_assert_eq!(dry.is_ok(), real.is_ok());
            if let (Err(d), Err(r)) = (&dry, &real) {
                prop_assert_eq!(&d.problem, &r.problem);
            }
        }
    }
}
