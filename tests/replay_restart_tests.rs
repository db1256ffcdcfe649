//! Replay determinism across executor runs and process restarts, and
//! divergence detection.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use duratask::providers::sqlite::SqliteStore;
use duratask::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use duratask::runtime::{replay, Runtime};
use duratask::{
    ActivityContext, Client, FailureDetails, OrchestrationContext, RuntimeStatus, StoreRef,
};

fn add_one_registry() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("AddOne", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("A", input).await
        })
        .build()
}

/// Running the executor twice without an intervening commit produces
/// identical work sets.
#[tokio::test]
async fn uncommitted_passes_are_idempotent() {
    let registry = add_one_registry();
    let handler = registry.resolve("AddOne").unwrap();

    let store = common::in_memory_store();
    let client = Client::new(store.clone());
    client.start_new_with_id("p1", "AddOne", "41").await.unwrap();

    let record = store.get_state("p1").await.unwrap().unwrap();
    let now = record.created_at_ms + 1;
    let first = replay::run_orchestration_pass(&record, handler.clone(), now);
    let second = replay::run_orchestration_pass(&record, handler, now);

    assert_eq!(first, second);
    assert_eq!(first.children.len(), 1);
    assert!(first.completion.is_none());
}

/// A pass that is lost before commit (crash window) reschedules exactly the
/// same external actions after the store is reopened from disk.
#[tokio::test]
async fn restart_reproduces_scheduled_actions() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/state.db", dir.path().display());

    let registry = add_one_registry();
    let handler = registry.resolve("AddOne").unwrap();

    let before_restart = {
        let store: StoreRef = Arc::new(SqliteStore::new(&url).await.unwrap());
        let client = Client::new(store.clone());
        client.start_new_with_id("r1", "AddOne", "41").await.unwrap();

        let record = store.get_state("r1").await.unwrap().unwrap();
        // Pass runs but the process dies before the commit lands.
        replay::run_orchestration_pass(&record, handler.clone(), record.created_at_ms + 1)
    };

    // "Restart": a fresh store over the same file.
    let store: StoreRef = Arc::new(SqliteStore::new(&url).await.unwrap());
    let record = store.get_state("r1").await.unwrap().unwrap();
    let after_restart =
        replay::run_orchestration_pass(&record, handler, record.created_at_ms + 1);

    assert_eq!(before_restart.children, after_restart.children);
    assert_eq!(before_restart.new_entries, after_restart.new_entries);
}

/// An instance survives a full host restart mid-workflow: the second host
/// resumes from durable history and finishes.
#[tokio::test]
async fn second_host_resumes_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/state.db", dir.path().display());

    let activities = || {
        ActivityRegistry::builder()
            .register("A", |_ctx: ActivityContext, input: String| async move {
                let n: u64 = input.parse().map_err(|e| format!("bad input: {e}"))?;
                Ok((n + 1).to_string())
            })
            .build()
    };
    let orchestrations = || {
        OrchestrationRegistry::builder()
            .register("Gate", |ctx: OrchestrationContext, input: String| async move {
                let bumped = ctx.schedule_activity("A", input).await?;
                let release = ctx.schedule_wait("Release").await;
                Ok(format!("{bumped}:{release}"))
            })
            .build()
    };

    let store_a: StoreRef = Arc::new(SqliteStore::new(&url).await.unwrap());
    let host_a = Runtime::start_with_options(
        store_a,
        Arc::new(activities()),
        orchestrations(),
        common::fast_options("host-a"),
    )
    .await;
    let client_a = host_a.client();

    client_a.start_new_with_id("gate", "Gate", "41").await.unwrap();

    // Wait until the activity has completed and the instance is parked on the
    // external event, then stop the first host.
    let deadline = tokio::time::Instant::now() + common::WAIT;
    loop {
        let status = client_a
            .get_status("gate", duratask::StatusOptions::all())
            .await
            .unwrap()
            .unwrap();
        let activity_done = status
            .history
            .as_ref()
            .map(|h| h.iter().any(|e| e.is_terminal()))
            .unwrap_or(false);
        if activity_done {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "activity never completed");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    host_a.shutdown().await;

    let store_b: StoreRef = Arc::new(SqliteStore::new(&url).await.unwrap());
    let host_b = Runtime::start_with_options(
        store_b,
        Arc::new(activities()),
        orchestrations(),
        common::fast_options("host-b"),
    )
    .await;
    let client_b = host_b.client();

    client_b.raise_event("gate", "Release", "go").await.unwrap();
    let status = client_b.wait_for_completion("gate", common::WAIT).await.unwrap();
    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("42:go"));

    host_b.shutdown().await;
}

/// A code path that depends on anything but history diverges on replay and
/// the instance fails permanently with a structured error.
async fn divergence_is_detected_with(store: StoreRef) {
    // Models a forbidden dependency on process state: the branch flips
    // between the first execution and the replay.
    let flipped = Arc::new(AtomicBool::new(false));

    let activities = ActivityRegistry::builder()
        .register("Left", |_ctx: ActivityContext, _input: String| async move {
            Ok("left".to_string())
        })
        .register("Right", |_ctx: ActivityContext, _input: String| async move {
            Ok("right".to_string())
        })
        .build();

    let flip = flipped.clone();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Unstable", move |ctx: OrchestrationContext, _input: String| {
            let flip = flip.clone();
            async move {
                let name = if flip.swap(true, Ordering::SeqCst) {
                    "Right"
                } else {
                    "Left"
                };
                ctx.schedule_activity(name, "").await
            }
        })
        .build();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(activities),
        orchestrations,
        common::fast_options("host-diverge"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("unstable", "Unstable", "").await.unwrap();
    let status = client.wait_for_completion("unstable", common::WAIT).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Failed);
    match status.error {
        Some(FailureDetails::Nondeterminism { message }) => {
            assert!(message.contains("Activity"), "unexpected message: {message}");
        }
        other => panic!("expected nondeterminism error, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn divergence_is_detected_inmem() {
    divergence_is_detected_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn divergence_is_detected_sqlite() {
    divergence_is_detected_with(common::sqlite_store().await).await;
}
