use std::cell::Cell;

use chrono::{DateTime, Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use statecraft_core::{ActorIdentity, Context, ModelId};
use statecraft_infra::jobs::JobResult;
use statecraft_infra::{Engine, EngineBuilder, InMemoryModelStore, ModelRegistration};
use statecraft_machine::{Collection, Command, CommandToken, ProcessingOptions};
use statecraft_todo::todo::{self, CreateTodoParams, Todo};
use statecraft_todo::{user, USERS_GROUP};

fn setup() -> (Engine<InMemoryModelStore>, ModelId, DateTime<Utc>) {
    let engine = EngineBuilder::new(InMemoryModelStore::new())
        .model(ModelRegistration::new(todo::state_machine().unwrap()))
        .model(ModelRegistration::new(user::state_machine().unwrap()))
        .authorization(statecraft_todo::authorization_rules())
        .job_handler("todo.*", |_| JobResult::Success)
        .build()
        .unwrap();
    let t0 = Utc::now();
    let alice = engine
        .submit(
            &user::create_user("Alice").unwrap(),
            &Context::system().at(t0),
            ProcessingOptions::default(),
        )
        .unwrap()
        .primary_model_id
        .unwrap();
    (engine, alice, t0)
}

fn as_alice(alice: ModelId, at: DateTime<Utc>) -> Context {
    Context::new(ActorIdentity::authenticated(alice, [USERS_GROUP])).at(at)
}

fn create_todo(engine: &Engine<InMemoryModelStore>, ctx: &Context, title: &str) -> ModelId {
    let command = CreateTodoParams::new(title, "Alice").into_command().unwrap();
    engine
        .submit(&command, ctx, ProcessingOptions::default())
        .unwrap()
        .primary_model_id
        .unwrap()
}

fn bench_command_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_latency");
    group.sample_size(500);

    group.bench_function("create_todo", |b| {
        let (engine, alice, t0) = setup();
        let ctx = as_alice(alice, t0);
        let command = CreateTodoParams::new("Buy milk", "Alice").into_command().unwrap();
        b.iter(|| {
            engine
                .submit(black_box(&command), &ctx, ProcessingOptions::default())
                .unwrap();
        });
    });

    // Alternates MarkComplete / UnmarkComplete, advancing the clock past the rate limit.
    group.bench_function("toggle_completion", |b| {
        let (engine, alice, t0) = setup();
        let id = create_todo(&engine, &as_alice(alice, t0), "Toggle me");
        let complete = Command::instance(todo::MARK_COMPLETE, id);
        let uncomplete = Command::instance(todo::UNMARK_COMPLETE, id);
        let step = Cell::new(1i64);
        b.iter(|| {
            let n = step.get();
            step.set(n + 1);
            let command = if n % 2 == 1 { &complete } else { &uncomplete };
            let ctx = as_alice(alice, t0 + Duration::seconds(2 * n));
            engine
                .submit(command, &ctx, ProcessingOptions::default())
                .unwrap();
        });
    });

    group.bench_function("create_todo_dry_run", |b| {
        let (engine, alice, t0) = setup();
        let ctx = as_alice(alice, t0);
        let command = CreateTodoParams::new("Buy milk", "Alice").into_command().unwrap();
        b.iter(|| {
            engine
                .submit(
                    black_box(&command),
                    &ctx,
                    ProcessingOptions::dry_run(CommandToken::simple()),
                )
                .unwrap();
        });
    });

    group.finish();
}

fn bench_authorized_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("authorized_reads");

    for todos in [10usize, 100, 1_000].iter() {
        let (engine, alice, t0) = setup();
        let ctx = as_alice(alice, t0);
        for i in 0..*todos {
            create_todo(&engine, &ctx, &format!("todo {i}"));
        }

        group.throughput(Throughput::Elements(*todos as u64));
        group.bench_with_input(BenchmarkId::new("list_own_todos", todos), todos, |b, _| {
            b.iter(|| {
                let listed = engine
                    .read(&ctx, |view| view.list(&Collection::<Todo>::all()))
                    .unwrap();
                black_box(listed.len())
            });
        });
    }

    group.finish();
}

fn bench_job_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_drain");

    for batch in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::new("billing_jobs", batch), batch, |b, &batch| {
            let (engine, alice, t0) = setup();
            let ctx = as_alice(alice, t0);
            b.iter(|| {
                for i in 0..batch {
                    create_todo(&engine, &ctx, &format!("todo {i}"));
                }
                black_box(engine.run_pending_jobs())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_command_latency, bench_authorized_reads, bench_job_drain);
criterion_main!(benches);
