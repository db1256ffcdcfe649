//! Store-contract checks shared by every backend: CAS discipline, candidate
//! filtering, lease proof, event queuing, and terminal-state immutability.

mod common;

use std::time::Duration;

use duratask::providers::WorkSet;
use duratask::{Client, InstanceFilter, RuntimeStatus, StoreRef};

async fn started(store: &StoreRef, id: &str, function: &str) {
    Client::new(store.clone())
        .start_new_with_id(id, function, "")
        .await
        .unwrap();
}

async fn candidate_filtering_with(store: StoreRef) {
    started(&store, "ready", "F").await;
    started(&store, "leased", "F").await;
    started(&store, "expired-lease", "F").await;
    started(&store, "done", "F").await;

    store
        .try_claim_lease("leased", "holder", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    store
        .try_claim_lease("expired-lease", "crashed", Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    store.terminate("done", "test").await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let ids: Vec<String> = store
        .get_ready_candidates(now, 16)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.instance_id)
        .collect();

    assert!(ids.contains(&"ready".to_string()));
    assert!(ids.contains(&"expired-lease".to_string()), "expired leases are claimable");
    assert!(!ids.contains(&"leased".to_string()), "live leases are excluded");
    assert!(!ids.contains(&"done".to_string()), "terminal instances are excluded");
}

#[tokio::test]
async fn candidate_filtering_inmem() {
    candidate_filtering_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn candidate_filtering_sqlite() {
    candidate_filtering_with(common::sqlite_store().await).await;
}

async fn full_state_requires_lease_proof_with(store: StoreRef) {
    started(&store, "proof", "F").await;

    assert!(store.get_full_state("proof", "nobody").await.is_err());

    store
        .try_claim_lease("proof", "holder", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert!(store.get_full_state("proof", "somebody-else").await.is_err());
    let record = store.get_full_state("proof", "holder").await.unwrap();
    assert_eq!(record.instance_id, "proof");
}

#[tokio::test]
async fn full_state_requires_lease_proof_inmem() {
    full_state_requires_lease_proof_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn full_state_requires_lease_proof_sqlite() {
    full_state_requires_lease_proof_with(common::sqlite_store().await).await;
}

/// Once terminal, nothing mutates the record: stale commits bounce and raises
/// are swallowed.
async fn terminal_state_is_immutable_with(store: StoreRef) {
    started(&store, "final", "F").await;

    // A host loads state at version 0, then the instance is terminated.
    let stale_version = store.get_state("final").await.unwrap().unwrap().version;
    store.terminate("final", "operator").await.unwrap();
    let frozen = store.get_state("final").await.unwrap().unwrap();

    // Stale commit from the old version: rejected.
    let committed = store
        .apply_work_set("final", stale_version, WorkSet::completed(Ok("late".into())))
        .await
        .unwrap();
    assert!(!committed);

    // Commit against the current version: still rejected, the record is
    // terminal.
    let committed = store
        .apply_work_set("final", frozen.version, WorkSet::completed(Ok("later".into())))
        .await
        .unwrap();
    assert!(!committed);

    store.raise_event("final", "E", "x").await.unwrap();

    let after = store.get_state("final").await.unwrap().unwrap();
    assert_eq!(frozen, after);
    assert_eq!(after.runtime_status(), RuntimeStatus::Terminated);
}

#[tokio::test]
async fn terminal_state_is_immutable_inmem() {
    terminal_state_is_immutable_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn terminal_state_is_immutable_sqlite() {
    terminal_state_is_immutable_with(common::sqlite_store().await).await;
}

async fn raise_keeps_per_name_fifo_with(store: StoreRef) {
    started(&store, "fifo", "F").await;

    store.raise_event("fifo", "E", "1").await.unwrap();
    store.raise_event("fifo", "F", "other").await.unwrap();
    store.raise_event("fifo", "E", "2").await.unwrap();
    store.raise_event("fifo", "E", "3").await.unwrap();

    let record = store.get_state("fifo").await.unwrap().unwrap();
    let e_queue: Vec<String> = record.event_queues.get("E").unwrap().iter().cloned().collect();
    assert_eq!(e_queue, vec!["1", "2", "3"]);
    assert_eq!(record.event_queues.get("F").unwrap().len(), 1);
}

#[tokio::test]
async fn raise_keeps_per_name_fifo_inmem() {
    raise_keeps_per_name_fifo_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn raise_keeps_per_name_fifo_sqlite() {
    raise_keeps_per_name_fifo_with(common::sqlite_store().await).await;
}

async fn list_and_count_filters_with(store: StoreRef) {
    started(&store, "a1", "Alpha").await;
    started(&store, "a2", "Alpha").await;
    started(&store, "b1", "Beta").await;
    store.terminate("a2", "test").await.unwrap();

    let alphas = store
        .list_instances(&InstanceFilter {
            function_name: Some("Alpha".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(alphas, vec!["a1".to_string(), "a2".to_string()]);

    let terminated = store
        .count_instances(&InstanceFilter {
            status: Some(RuntimeStatus::Terminated),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(terminated, 1);

    let pending_alphas = store
        .count_instances(&InstanceFilter {
            status: Some(RuntimeStatus::Pending),
            function_name: Some("Alpha".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending_alphas, 1);
}

#[tokio::test]
async fn list_and_count_filters_inmem() {
    list_and_count_filters_with(common::in_memory_store()).await;
}

#[tokio::test]
async fn list_and_count_filters_sqlite() {
    list_and_count_filters_with(common::sqlite_store().await).await;
}
