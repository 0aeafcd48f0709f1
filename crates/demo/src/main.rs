//! Scripted walk through the todo domain: a user creates, completes and
//! trashes a todo, and the scheduler purges it a day later.

use anyhow::Context as _;
use chrono::{Duration, Utc};

use statecraft_core::{ActorIdentity, Context};
use statecraft_infra::jobs::JobResult;
use statecraft_infra::{EngineBuilder, EngineConfig, InMemoryModelStore, ModelRegistration};
use statecraft_machine::{Command, ProcessingOptions};
use statecraft_todo::todo::{self, CreateTodoParams};
use statecraft_todo::{USERS_GROUP, UPDATE_USER_BILL_JOB, user};

fn main() -> anyhow::Result<()> {
    statecraft_observability::init();

    let engine = EngineBuilder::new(InMemoryModelStore::new())
        .config(EngineConfig::from_env())
        .model(ModelRegistration::new(todo::state_machine()?))
        .model(ModelRegistration::new(user::state_machine()?))
        .authorization(statecraft_todo::authorization_rules())
        .job_handler(UPDATE_USER_BILL_JOB, |job| {
            tracing::info!(payload = %job.payload, "billing user");
            JobResult::Success
        })
        .build()?;
    engine.start()?;

    let t0 = Utc::now();
    let options = ProcessingOptions::default;

    let alice = engine
        .submit(&user::create_user("Alice")?, &Context::system().at(t0), options())?
        .primary_model_id
        .context("user was not created")?;
    let as_alice = |offset: Duration| {
        Context::new(ActorIdentity::authenticated(alice, [USERS_GROUP])).at(t0 + offset)
    };

    let todo_id = engine
        .submit(
            &CreateTodoParams::new("Buy milk", "Alice").into_command()?,
            &as_alice(Duration::zero()),
            options(),
        )?
        .primary_model_id
        .context("todo was not created")?;

    engine.submit(&Command::instance(todo::MARK_COMPLETE, todo_id), &as_alice(Duration::seconds(2)), options())?;
    if let Err(rejected) = engine.submit(
        &Command::instance(todo::UNMARK_COMPLETE, todo_id),
        &as_alice(Duration::milliseconds(2500)),
        options(),
    ) {
        tracing::info!(problem = %rejected, "toggling too fast was refused");
    }
    engine.submit(&Command::instance(todo::MOVE_TO_TRASH, todo_id), &as_alice(Duration::seconds(3)), options())?;

    let report = engine.tick(t0 + Duration::seconds(3) + todo::trash_retention());
    tracing::info!(fired = report.fired, failed = report.failed, "scheduler tick");
    tracing::info!(ran = engine.run_pending_jobs(), "jobs drained");

    let log = engine.read(&as_alice(Duration::days(2)), |view| view.event_log())?;
    println!("{}", serde_json::to_string_pretty(&log)?);

    engine.shutdown();
    Ok(())
}
