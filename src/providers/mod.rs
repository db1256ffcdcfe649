//! State-store abstraction and the record-level mutation semantics shared by
//! every backend.
//!
//! A store is a mapping from `instance_id` to [`InstanceRecord`] in which every
//! write is atomic on a single record and conditioned on the record's monotone
//! `version` (compare-and-swap). The runtime computes orchestration semantics
//! and hands the store explicit work sets; stores never inspect history to make
//! decisions of their own. The one store-side decision (deliver a raised event
//! to the earliest matching waiter, or queue it) is shared pure code over the
//! record so that every backend applies identical semantics inside its own
//! atomicity envelope.
//!
//! Backends need no cross-record transactions: child records are created after
//! the parent's work-set CAS, and the parent-wake step after a child completes
//! is a separate CAS that the scheduler retries.

use std::time::Duration;

use crate::{
    AwaitedEvent, EntryStatus, FailureDetails, HistoryEntry, InstanceRecord, RuntimeStatus,
};

pub mod error;
pub mod in_memory;
pub mod instrumented;
pub mod sqlite;

pub use error::StoreError;

/// Lightweight projection returned by the ready-candidate scan. Deliberately
/// excludes history so polling stays cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCandidate {
    pub instance_id: String,
    pub function_name: String,
    pub execute_after_ms: u64,
    pub version: u64,
    pub lease_owner: Option<String>,
    pub lease_expires_at_ms: Option<u64>,
}

/// A child instance to create once the parent's work set has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub instance_id: String,
    pub function_name: String,
    pub input: String,
}

/// The batch of state mutations produced by one replay pass, committed to the
/// instance record in a single CAS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    /// History entries to append, in decision order.
    pub new_entries: Vec<HistoryEntry>,

    /// Timer entries (by child id) that came due during this pass and
    /// transition to succeeded.
    pub fired_timers: Vec<String>,

    /// Event names whose queue head was consumed by a new wait slot, one
    /// occurrence per consumed payload, in consumption order.
    pub consumed_events: Vec<String>,

    /// Wait slots to append to the awaited-events FIFO.
    pub new_waiters: Vec<AwaitedEvent>,

    /// New `execute_after`, when the pass advances it (next due timer, or the
    /// parked sentinel while suspended on children/events).
    pub execute_after_ms: Option<u64>,

    /// Terminal outcome, present when the pass ran to completion.
    pub completion: Option<Result<String, FailureDetails>>,

    /// Whether the commit also releases the committing host's lease.
    pub release_lease: bool,

    /// Child records to create after the commit (activities and
    /// sub-orchestrators scheduled by this pass).
    pub children: Vec<ChildSpec>,
}

impl WorkSet {
    /// A work set that only records a terminal outcome.
    pub fn completed(outcome: Result<String, FailureDetails>) -> Self {
        Self {
            completion: Some(outcome),
            release_lease: true,
            ..Default::default()
        }
    }
}

/// Filters for the management `count` / `list` operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub status: Option<RuntimeStatus>,
    pub function_name: Option<String>,
    pub parent_instance_id: Option<String>,
}

impl InstanceFilter {
    pub(crate) fn matches(&self, record: &InstanceRecord) -> bool {
        if let Some(status) = self.status {
            if record.runtime_status() != status {
                return false;
            }
        }
        if let Some(name) = &self.function_name {
            if &record.function_name != name {
                return false;
            }
        }
        if let Some(parent) = &self.parent_instance_id {
            if record.parent_instance_id.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Durable persistence of instance records with optimistic concurrency and
/// lease columns.
///
/// Required backend properties:
/// - single-record atomicity sufficient for CAS and for the raise-event
///   deliver-or-enqueue (implementable as one `UPDATE .. WHERE version = ?`);
/// - indexes on `(is_completed, execute_after)` and
///   `(lease_owner, lease_expires_at)` so polling stays cheap;
/// - no cross-record transactions.
#[async_trait::async_trait]
pub trait StateStore: std::any::Any + Send + Sync {
    /// Backend name for logging and diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }

    /// Create a record that must not already exist. Returns `false` when the
    /// id is taken (the existing record is left untouched).
    async fn create_state(&self, record: InstanceRecord) -> Result<bool, StoreError>;

    /// Persist a record. With `expected_version`, the write is a CAS against
    /// the currently stored version and `Ok(false)` reports the conflict;
    /// without it the write is an unconditional upsert.
    async fn save_state(
        &self,
        record: InstanceRecord,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError>;

    async fn get_state(&self, instance_id: &str) -> Result<Option<InstanceRecord>, StoreError>;

    /// Scan for instances a scheduler may claim: not completed, due, and with
    /// no live lease. Returns at most `max` lightweight projections ordered by
    /// `execute_after`.
    async fn get_ready_candidates(
        &self,
        now_ms: u64,
        max: usize,
    ) -> Result<Vec<ReadyCandidate>, StoreError>;

    /// Claim the instance for `host_id`. Succeeds iff no lease is set or the
    /// existing lease has expired; returns the post-claim version.
    async fn try_claim_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        duration: Duration,
    ) -> Result<Option<u64>, StoreError>;

    /// Extend a held lease. Succeeds iff `host_id` owns the lease and the
    /// version still matches; returns the post-renewal version.
    async fn renew_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        duration: Duration,
        expected_version: u64,
    ) -> Result<Option<u64>, StoreError>;

    /// Clear a held lease. Succeeds iff `host_id` owns it and the version
    /// still matches.
    async fn release_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    /// Load the full record under proof of lease ownership; errors when the
    /// caller does not hold a live lease (protects against stale reads).
    async fn get_full_state(
        &self,
        instance_id: &str,
        expected_lease_owner: &str,
    ) -> Result<InstanceRecord, StoreError>;

    /// Commit one pass's work set in a single CAS keyed on `expected_version`.
    /// `Ok(false)` reports a version conflict (or a terminal record); the
    /// caller discards the work set.
    async fn apply_work_set(
        &self,
        instance_id: &str,
        expected_version: u64,
        work_set: WorkSet,
    ) -> Result<bool, StoreError>;

    /// Atomic deliver-or-enqueue: hand the payload to the earliest waiter for
    /// `event_name` (completing its history entry and waking the instance) or
    /// append it to the per-name queue. Raising against a completed instance
    /// is a silent no-op.
    async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        payload: &str,
    ) -> Result<(), StoreError>;

    /// CAS-mark the instance completed with a termination error, regardless of
    /// any held lease. Idempotent on already-terminal instances.
    async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), StoreError>;

    /// Delete the record. Returns the number of records deleted (0 or 1).
    /// Children of a purged parent are orphaned; cleanup is best-effort.
    async fn purge(&self, instance_id: &str) -> Result<u64, StoreError>;

    async fn count_instances(&self, filter: &InstanceFilter) -> Result<u64, StoreError>;

    /// Instance ids matching the filter. For management surfaces, not the
    /// runtime hot path.
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<String>, StoreError>;
}

// ===== Record-level mutation semantics =====
//
// Pure functions over InstanceRecord; each backend runs them inside its own
// atomic envelope. Every mutation bumps `version` exactly once.

/// Apply a committed work set to the record. The caller has already checked
/// the version CAS and that the record is not terminal.
pub(crate) fn apply_work_set_to_record(record: &mut InstanceRecord, ws: &WorkSet, now_ms: u64) {
    for child_id in &ws.fired_timers {
        if let Some(entry) = record.entry_mut(child_id) {
            if entry.status == EntryStatus::Scheduled {
                entry.succeed(None, now_ms);
            }
        }
    }

    record.history.extend(ws.new_entries.iter().cloned());

    for name in &ws.consumed_events {
        let drained = match record.event_queues.get_mut(name) {
            Some(queue) => {
                queue.pop_front();
                queue.is_empty()
            }
            None => false,
        };
        if drained {
            record.event_queues.remove(name);
        }
    }

    record.awaited_events.extend(ws.new_waiters.iter().cloned());

    if let Some(at) = ws.execute_after_ms {
        record.execute_after_ms = at;
    }

    if let Some(outcome) = &ws.completion {
        record.is_completed = true;
        match outcome {
            Ok(result) => record.completed_result = Some(result.clone()),
            Err(error) => record.completed_error = Some(error.clone()),
        }
    }

    if ws.release_lease {
        record.lease_owner = None;
        record.lease_expires_at_ms = None;
    }

    record.version += 1;
    record.updated_at_ms = now_ms;
}

/// Deliver a raised payload to the earliest waiter for `event_name`, or queue
/// it for the next wait slot. The caller has already rejected terminal records.
pub(crate) fn deliver_or_enqueue(
    record: &mut InstanceRecord,
    event_name: &str,
    payload: &str,
    now_ms: u64,
) {
    let waiter_pos = record
        .awaited_events
        .iter()
        .position(|w| w.event_name == event_name);
    match waiter_pos {
        Some(pos) => {
            let waiter = record
                .awaited_events
                .remove(pos)
                .expect("waiter position is in range");
            if let Some(entry) = record.entry_mut(&waiter.slot_id) {
                if entry.status == EntryStatus::Scheduled {
                    entry.succeed(Some(payload.to_string()), now_ms);
                }
            }
            record.execute_after_ms = now_ms;
        }
        None => {
            record
                .event_queues
                .entry(event_name.to_string())
                .or_default()
                .push_back(payload.to_string());
        }
    }
    record.version += 1;
    record.updated_at_ms = now_ms;
}

/// Transition the record to completed-failed with a termination error.
pub(crate) fn mark_terminated(record: &mut InstanceRecord, reason: &str, now_ms: u64) {
    record.is_completed = true;
    record.completed_error = Some(FailureDetails::Terminated {
        reason: reason.to_string(),
    });
    record.lease_owner = None;
    record.lease_expires_at_ms = None;
    record.version += 1;
    record.updated_at_ms = now_ms;
}

/// Record a completed child's outcome on the parent and wake it. Returns false
/// when there is nothing to do (entry missing or already terminal), in which
/// case the record is untouched.
pub(crate) fn record_child_outcome(
    parent: &mut InstanceRecord,
    child_instance_id: &str,
    outcome: &Result<String, FailureDetails>,
    now_ms: u64,
) -> bool {
    let applied = match parent.entry_mut(child_instance_id) {
        Some(entry) if entry.status == EntryStatus::Scheduled => {
            match outcome {
                Ok(result) => entry.succeed(Some(result.clone()), now_ms),
                Err(error) => entry.fail(error.clone(), now_ms),
            }
            true
        }
        _ => false,
    };
    if applied {
        parent.execute_after_ms = now_ms;
        parent.version += 1;
        parent.updated_at_ms = now_ms;
    }
    applied
}

/// Whether a candidate row is claimable at `now_ms` (no lease, or expired).
pub(crate) fn lease_claimable(
    lease_owner: &Option<String>,
    lease_expires_at_ms: Option<u64>,
    now_ms: u64,
) -> bool {
    match (lease_owner, lease_expires_at_ms) {
        (Some(_), Some(expires)) => expires <= now_ms,
        _ => true,
    }
}
