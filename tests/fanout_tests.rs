//! Fan-out/fan-in: all parallel calls are recorded in one pass; `join`
//! returns results in call order.

mod common;

use std::sync::Arc;

use duratask::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use duratask::runtime::Runtime;
use duratask::{
    ActivityContext, EntryKind, EntryStatus, OrchestrationContext, RuntimeStatus, StoreRef,
};

async fn fan_out_fan_in_with(store: StoreRef) {
    let activities = ActivityRegistry::builder()
        .register("Times10", |_ctx: ActivityContext, input: String| async move {
            let k: u64 = input.parse().map_err(|e| format!("bad input: {e}"))?;
            Ok((k * 10).to_string())
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOut", |ctx: OrchestrationContext, _input: String| async move {
            let futures = vec![
                ctx.schedule_activity("Times10", "1"),
                ctx.schedule_activity("Times10", "2"),
                ctx.schedule_activity("Times10", "3"),
            ];
            let results = ctx.join(futures).await;
            let mut outputs = Vec::new();
            for result in results {
                outputs.push(result?);
            }
            Ok(outputs.join(","))
        })
        .build();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(activities),
        orchestrations,
        common::fast_options("host-fanout"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("fan-1", "FanOut", "").await.unwrap();
    let status = client.wait_for_completion("fan-1", common::WAIT).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("10,20,30"));

    // All three calls landed in history from the first pass, in call order.
    let history = status.history.unwrap();
    assert_eq!(history.len(), 3);
    let inputs: Vec<&str> = history
        .iter()
        .map(|e| match &e.kind {
            EntryKind::Activity { input, .. } => input.as_str(),
            other => panic!("expected activity entry, got {other:?}"),
        })
        .collect();
    assert_eq!(inputs, vec!["1", "2", "3"]);
    assert!(history.iter().all(|e| e.status == EntryStatus::Succeeded));

    rt.shutdown().await;
}

#[tokio::test]
async fn fan_out_fan_in_inmem() {
    fan_out_fan_in_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn fan_out_fan_in_sqlite() {
    fan_out_fan_in_with(common::sqlite_store().await).await;
}

async fn fan_out_with_partial_failures_with(store: StoreRef) {
    let activities = ActivityRegistry::builder()
        .register("Flaky", |_ctx: ActivityContext, input: String| async move {
            if input == "2" {
                Err("item 2 is cursed".to_string())
            } else {
                Ok(format!("ok-{input}"))
            }
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOutErrors", |ctx: OrchestrationContext, _input: String| async move {
            let futures = vec![
                ctx.schedule_activity("Flaky", "1"),
                ctx.schedule_activity("Flaky", "2"),
                ctx.schedule_activity("Flaky", "3"),
            ];
            let results = ctx.join(futures).await;
            let successes: Vec<String> = results.into_iter().filter_map(|r| r.ok()).collect();
            Ok(successes.join(","))
        })
        .build();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(activities),
        orchestrations,
        common::fast_options("host-fanout-err"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("fan-2", "FanOutErrors", "").await.unwrap();
    let status = client.wait_for_completion("fan-2", common::WAIT).await.unwrap();
    assert_eq!(status.output.as_deref(), Some("ok-1,ok-3"));

    let history = status.history.unwrap();
    assert_eq!(
        history.iter().filter(|e| e.status == EntryStatus::Failed).count(),
        1
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn fan_out_with_partial_failures_inmem() {
    fan_out_with_partial_failures_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn fan_out_with_partial_failures_sqlite() {
    fan_out_with_partial_failures_with(common::sqlite_store().await).await;
}
