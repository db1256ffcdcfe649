//! Sequential composition: chained activities, loops, and compensation after
//! a caught activity failure.

mod common;

use std::sync::Arc;

use duratask::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use duratask::runtime::Runtime;
use duratask::{
    ActivityContext, EntryKind, EntryStatus, InstanceFilter, OrchestrationContext, RuntimeStatus,
    StatusOptions, StoreRef,
};

async fn chained_activities_with(store: StoreRef) {
    let activities = ActivityRegistry::builder()
        .register("F1", |_ctx: ActivityContext, _input: String| async move {
            Ok("r1".to_string())
        })
        .register("F2", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("r2:{input}"))
        })
        .register("F3", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("r3:{input}"))
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("O", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.schedule_activity("F1", "").await?;
            let b = ctx.schedule_activity("F2", a).await?;
            let c = ctx.schedule_activity("F3", b).await?;
            Ok(c)
        })
        .build();

    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(activities),
        orchestrations,
        common::fast_options("host-chain"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("i1", "O", "").await.unwrap();
    let status = client.wait_for_completion("i1", common::WAIT).await.unwrap();

    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("r3:r2:r1"));

    // Exactly three activity entries, in call order, all succeeded.
    let history = status.history.unwrap();
    assert_eq!(history.len(), 3);
    let names: Vec<&str> = history
        .iter()
        .map(|e| match &e.kind {
            EntryKind::Activity { function_name, .. } => function_name.as_str(),
            other => panic!("expected activity entry, got {other:?}"),
        })
        .collect();
    assert_eq!(names, vec!["F1", "F2", "F3"]);
    assert!(history.iter().all(|e| e.status == EntryStatus::Succeeded));

    // Each call produced a child record pointing back at the parent.
    let children = client
        .list_instances(&InstanceFilter {
            parent_instance_id: Some("i1".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 3);

    rt.shutdown().await;
}

#[tokio::test]
async fn chained_activities_inmem() {
    chained_activities_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn chained_activities_sqlite() {
    chained_activities_with(common::sqlite_store().await).await;
}

async fn loop_accumulation_with(store: StoreRef) {
    let activities = ActivityRegistry::builder()
        .register("Append", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("{input}x"))
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Loop", |ctx: OrchestrationContext, _input: String| async move {
            let mut acc = String::from("start");
            for _ in 0..3 {
                acc = ctx.schedule_activity("Append", acc).await?;
            }
            Ok(acc)
        })
        .build();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(activities),
        orchestrations,
        common::fast_options("host-loop"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("loop-1", "Loop", "").await.unwrap();
    let status = client.wait_for_completion("loop-1", common::WAIT).await.unwrap();
    assert_eq!(status.output.as_deref(), Some("startxxx"));

    rt.shutdown().await;
}

#[tokio::test]
async fn loop_accumulation_inmem() {
    loop_accumulation_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn loop_accumulation_sqlite() {
    loop_accumulation_with(common::sqlite_store().await).await;
}

async fn compensation_after_failure_with(store: StoreRef) {
    let activities = ActivityRegistry::builder()
        .register("Fragile", |_ctx: ActivityContext, input: String| async move {
            if input == "bad" {
                Err("boom".to_string())
            } else {
                Ok("ok".to_string())
            }
        })
        .register("Recover", |_ctx: ActivityContext, _input: String| async move {
            Ok("recovered".to_string())
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Compensate", |ctx: OrchestrationContext, _input: String| async move {
            match ctx.schedule_activity("Fragile", "bad").await {
                Ok(v) => Ok(v),
                Err(_e) => ctx.schedule_activity("Recover", "").await,
            }
        })
        .build();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(activities),
        orchestrations,
        common::fast_options("host-comp"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("comp-1", "Compensate", "").await.unwrap();
    let status = client.wait_for_completion("comp-1", common::WAIT).await.unwrap();
    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("recovered"));

    // The caught failure stays in history; the compensating call is a new
    // entry with a fresh child id.
    let history = status.history.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, EntryStatus::Failed);
    assert_eq!(history[1].status, EntryStatus::Succeeded);
    assert_ne!(history[0].child_instance_id, history[1].child_instance_id);

    rt.shutdown().await;
}

#[tokio::test]
async fn compensation_after_failure_inmem() {
    compensation_after_failure_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn compensation_after_failure_sqlite() {
    compensation_after_failure_with(common::sqlite_store().await).await;
}

async fn status_options_e2e_with(store: StoreRef) {
    let activities = ActivityRegistry::builder()
        .register("Echo", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Echoer", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("Echo", input).await
        })
        .build();

    let rt = Runtime::start_with_options(
        store,
        Arc::new(activities),
        orchestrations,
        common::fast_options("host-status"),
    )
    .await;
    let client = rt.client();

    client.start_new_with_id("s1", "Echoer", "payload").await.unwrap();
    client.wait_for_completion("s1", common::WAIT).await.unwrap();

    let bare = client
        .get_status("s1", StatusOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert!(bare.input.is_none());
    assert!(bare.output.is_none());
    assert!(bare.history.is_none());

    let full = client.get_status("s1", StatusOptions::all()).await.unwrap().unwrap();
    assert_eq!(full.input.as_deref(), Some("payload"));
    assert_eq!(full.output.as_deref(), Some("payload"));

    rt.shutdown().await;
}

#[tokio::test]
async fn status_options_e2e_inmem() {
    status_options_e2e_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn status_options_e2e_sqlite() {
    status_options_e2e_with(common::sqlite_store().await).await;
}
