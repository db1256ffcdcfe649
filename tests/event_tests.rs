//! External events: FIFO pairing of raises and wait slots, queuing ahead of
//! waiters, and payload decoding at the wait site.

mod common;

use std::sync::Arc;
use std::time::Duration;

use duratask::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use duratask::runtime::Runtime;
use duratask::{FailureDetails, OrchestrationContext, RuntimeStatus, StoreRef};

fn pair_registry() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Pair", |ctx: OrchestrationContext, _input: String| async move {
            let first = ctx.schedule_wait("E").await;
            let second = ctx.schedule_wait("E").await;
            Ok(format!("({first},{second})"))
        })
        .build()
}

async fn raise_before_and_after_waits_with(store: StoreRef) {
    let rt = Runtime::start_with_options(
        store,
        Arc::new(ActivityRegistry::builder().build()),
        pair_registry(),
        common::fast_options("host-events"),
    )
    .await;
    let client = rt.client();

    // First raise lands while the instance may not even have run its first
    // pass; it must be held and consumed by the first slot.
    client.start_new_with_id("i2", "Pair", "").await.unwrap();
    client.raise_event("i2", "E", "a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.raise_event("i2", "E", "b").await.unwrap();

    let status = client.wait_for_completion("i2", common::WAIT).await.unwrap();
    assert_eq!(status.output.as_deref(), Some("(a,b)"));

    rt.shutdown().await;
}

#[tokio::test]
async fn raise_before_and_after_waits_inmem() {
    raise_before_and_after_waits_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn raise_before_and_after_waits_sqlite() {
    raise_before_and_after_waits_with(common::sqlite_store().await).await;
}

async fn fifo_pairing_of_three_raises_with(store: StoreRef) {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Triple", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.schedule_wait("E").await;
            let b = ctx.schedule_wait("E").await;
            let c = ctx.schedule_wait("E").await;
            Ok(format!("{a}{b}{c}"))
        })
        .build();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(ActivityRegistry::builder().build()),
        orchestrations,
        common::fast_options("host-fifo"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("triple", "Triple", "").await.unwrap();
    // The kth raise pairs with the kth wait regardless of how raises and wait
    // slots interleave.
    client.raise_event("triple", "E", "a").await.unwrap();
    client.raise_event("triple", "E", "b").await.unwrap();
    client.raise_event("triple", "E", "c").await.unwrap();

    let status = client.wait_for_completion("triple", common::WAIT).await.unwrap();
    assert_eq!(status.output.as_deref(), Some("abc"));

    rt.shutdown().await;
}

#[tokio::test]
async fn fifo_pairing_of_three_raises_inmem() {
    fifo_pairing_of_three_raises_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn fifo_pairing_of_three_raises_sqlite() {
    fifo_pairing_of_three_raises_with(common::sqlite_store().await).await;
}

async fn event_queued_before_any_waiter_with(store: StoreRef) {
    let orchestrations = OrchestrationRegistry::builder()
        .register("WaitOne", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.schedule_wait("E").await)
        })
        .build();

    // Create the instance and raise before any worker host exists: the
    // payload is held in the per-name queue.
    let client = duratask::Client::new(store.clone());
    client.start_new_with_id("held", "WaitOne", "").await.unwrap();
    client.raise_event("held", "E", "x").await.unwrap();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(ActivityRegistry::builder().build()),
        orchestrations,
        common::fast_options("host-held"),
    )
    .await;

    let status = rt
        .client()
        .wait_for_completion("held", common::WAIT)
        .await
        .unwrap();
    assert_eq!(status.output.as_deref(), Some("x"));

    rt.shutdown().await;
}

#[tokio::test]
async fn event_queued_before_any_waiter_inmem() {
    event_queued_before_any_waiter_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn event_queued_before_any_waiter_sqlite() {
    event_queued_before_any_waiter_with(common::sqlite_store().await).await;
}

async fn undecodable_payload_fails_the_wait_site_with(store: StoreRef) {
    #[derive(serde::Deserialize)]
    struct Approval {
        #[allow(dead_code)]
        approver: String,
    }

    let orchestrations = OrchestrationRegistry::builder()
        .register("Typed", |ctx: OrchestrationContext, _input: String| async move {
            let approval: Approval = ctx.schedule_wait_typed("Approval").await?;
            Ok(approval.approver)
        })
        .build();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(ActivityRegistry::builder().build()),
        orchestrations,
        common::fast_options("host-typed"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("typed", "Typed", "").await.unwrap();
    client.raise_event("typed", "Approval", "37").await.unwrap();

    let status = client.wait_for_completion("typed", common::WAIT).await.unwrap();
    // The decode failure surfaces at the wait call site; this orchestrator
    // propagates it, so the instance fails as an application error.
    assert_eq!(status.runtime_status, RuntimeStatus::Failed);
    match status.error {
        Some(FailureDetails::Application { message }) => {
            assert!(message.contains("payload decode"), "unexpected message: {message}");
        }
        other => panic!("expected application failure, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn undecodable_payload_fails_the_wait_site_inmem() {
    undecodable_payload_fails_the_wait_site_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn undecodable_payload_fails_the_wait_site_sqlite() {
    undecodable_payload_fails_the_wait_site_with(common::sqlite_store().await).await;
}
