//! The polling scheduler: discovers ready instances, claims leases, dispatches
//! work, commits work sets, and wakes parents.
//!
//! Every host runs an identical loop against the shared store. Correctness
//! does not depend on the loop at all: leases only reduce contention; the
//! version CAS on commit is what guarantees no two passes of the same instance
//! ever both land. A version conflict discards the work set and the instance
//! is naturally re-queued; a storage error backs off to the next cycle.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::providers::WorkSet;
use crate::runtime::lease::LeaseRenewer;
use crate::runtime::observability::ObservabilityHandle;
use crate::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use crate::runtime::{replay, RuntimeOptions};
use crate::{
    now_ms, ActivityContext, EntryKind, FailureDetails, InstanceRecord, StoreRef,
};

/// Bounded retries for the parent-wake CAS; the child's completion is already
/// durable, so retrying with a fresh read is idempotent.
const PARENT_WAKE_RETRIES: usize = 8;

pub(crate) struct Scheduler {
    store: StoreRef,
    activities: Arc<ActivityRegistry>,
    orchestrations: OrchestrationRegistry,
    options: Arc<RuntimeOptions>,
    observability: Arc<ObservabilityHandle>,
    cancel: CancellationToken,
    execution_slots: Arc<Semaphore>,
}

impl Scheduler {
    pub(crate) fn new(
        store: StoreRef,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: Arc<RuntimeOptions>,
        observability: Arc<ObservabilityHandle>,
        cancel: CancellationToken,
    ) -> Self {
        let execution_slots = Arc::new(Semaphore::new(options.max_concurrent_instances));
        Self {
            store,
            activities,
            orchestrations,
            options,
            observability,
            cancel,
            execution_slots,
        }
    }

    /// The polling cycle. On cancellation the loop stops issuing new claims,
    /// drains in-flight executions, and returns.
    pub(crate) async fn run(self: Arc<Self>) {
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            while in_flight.try_join_next().is_some() {}

            let now = now_ms();
            match self
                .store
                .get_ready_candidates(now, self.options.poll_batch_size)
                .await
            {
                Ok(candidates) => {
                    for candidate in candidates {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        let permit = match self.execution_slots.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => break, // at capacity; next cycle retries
                        };
                        match self
                            .store
                            .try_claim_lease(
                                &candidate.instance_id,
                                &self.options.host_id,
                                self.options.lease_duration,
                            )
                            .await
                        {
                            Ok(Some(version)) => {
                                self.observability.record_lease_acquired();
                                let scheduler = self.clone();
                                let instance_id = candidate.instance_id.clone();
                                in_flight.spawn(async move {
                                    scheduler.process_instance(&instance_id, version).await;
                                    scheduler.observability.record_lease_released();
                                    drop(permit);
                                });
                            }
                            Ok(None) => {
                                // Lost the race to another host; skip.
                                drop(permit);
                            }
                            Err(e) => {
                                drop(permit);
                                debug!(
                                    target: "duratask::scheduler",
                                    instance_id = %candidate.instance_id,
                                    error = %e,
                                    "lease claim errored"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(target: "duratask::scheduler", error = %e, "candidate scan failed; backing off");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.polling_interval) => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
    }

    /// One claimed instance: load under lease proof, dispatch, commit, then
    /// post-commit effects (child creation, parent wake).
    async fn process_instance(&self, instance_id: &str, claimed_version: u64) {
        let record = match self
            .store
            .get_full_state(instance_id, &self.options.host_id)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                debug!(target: "duratask::scheduler", instance_id, error = %e, "full-state load failed under lease");
                self.best_effort_release(instance_id).await;
                return;
            }
        };

        if record.is_completed {
            // Terminated or completed between the scan and our claim.
            self.best_effort_release(instance_id).await;
            return;
        }

        let activity_cancel = CancellationToken::new();
        let renewer = LeaseRenewer::start(
            self.store.clone(),
            record.instance_id.clone(),
            self.options.host_id.clone(),
            self.options.lease_duration,
            self.options.lease_renewal_interval,
            claimed_version,
            activity_cancel.clone(),
        );

        let is_orchestration = self.orchestrations.has(&record.function_name);
        let work_set = if let Some(handler) = self.orchestrations.resolve(&record.function_name) {
            let span = tracing::debug_span!(
                target: "duratask::scheduler",
                "orchestration_pass",
                instance_id = %record.instance_id,
                function_name = %record.function_name
            );
            let _enter = span.enter();
            replay::run_orchestration_pass(&record, handler, now_ms())
        } else if let Some(handler) = self.activities.resolve(&record.function_name) {
            self.run_activity(&record, handler, activity_cancel.clone()).await
        } else {
            warn!(
                target: "duratask::scheduler",
                instance_id = %record.instance_id,
                function_name = %record.function_name,
                "no registered function; failing instance"
            );
            WorkSet::completed(Err(FailureDetails::Unregistered {
                function_name: record.function_name.clone(),
            }))
        };

        let (version, lost) = renewer.stop().await;
        if lost {
            debug!(target: "duratask::scheduler", instance_id, "lease lost; discarding work set");
            return;
        }

        match self
            .store
            .apply_work_set(instance_id, version, work_set.clone())
            .await
        {
            Ok(true) => {
                self.record_commit_metrics(&record, &work_set, is_orchestration);
                self.create_children(&record, &work_set).await;
                if let Some(outcome) = &work_set.completion {
                    if let Some(parent_id) = &record.parent_instance_id {
                        self.wake_parent(parent_id, &record.instance_id, outcome).await;
                    }
                }
            }
            Ok(false) => {
                // Another CAS raced through (event delivery, termination).
                // Discard; the instance re-queues via its own execute_after.
                debug!(target: "duratask::scheduler", instance_id, "commit conflict; work set discarded");
                self.best_effort_release(instance_id).await;
            }
            Err(e) => {
                warn!(target: "duratask::scheduler", instance_id, error = %e, "commit failed");
                self.best_effort_release(instance_id).await;
            }
        }
    }

    async fn run_activity(
        &self,
        record: &InstanceRecord,
        handler: Arc<dyn crate::runtime::ActivityHandler>,
        cancel: CancellationToken,
    ) -> WorkSet {
        let ctx = ActivityContext::new(
            record.instance_id.clone(),
            record.function_name.clone(),
            record.parent_instance_id.clone(),
            self.options.host_id.clone(),
            cancel,
        );
        let started = std::time::Instant::now();
        let result = handler.invoke(ctx, record.input.clone()).await;
        self.observability
            .record_function_duration_ms(started.elapsed().as_millis() as u64);
        if result.is_err() {
            self.observability.record_function_failure();
        }
        WorkSet::completed(result.map_err(|message| FailureDetails::Application { message }))
    }

    fn record_commit_metrics(&self, record: &InstanceRecord, ws: &WorkSet, is_orchestration: bool) {
        if is_orchestration && record.history.is_empty() {
            self.observability.record_orchestration_started();
        }
        for entry in &ws.new_entries {
            match entry.kind {
                EntryKind::Activity { .. } | EntryKind::SubOrchestration { .. } => {
                    self.observability.record_function_call();
                }
                EntryKind::Timer { .. } => self.observability.record_timer_created(),
                EntryKind::External { .. } => {}
            }
        }
        for _ in &ws.fired_timers {
            self.observability.record_timer_fired();
        }
        for _ in &ws.consumed_events {
            self.observability.record_event_delivered();
        }
        if is_orchestration {
            match &ws.completion {
                Some(Ok(_)) => {
                    let duration = now_ms().saturating_sub(record.created_at_ms);
                    self.observability.record_orchestration_completed(duration);
                }
                Some(Err(error)) => {
                    self.observability.record_orchestration_failed(error.category());
                }
                None => {}
            }
        }
    }

    /// Create the child records a committed pass scheduled. Creation is
    /// idempotent (create-only), so a re-run of the same pass is harmless.
    async fn create_children(&self, parent: &InstanceRecord, ws: &WorkSet) {
        let now = now_ms();
        for child in &ws.children {
            let record = InstanceRecord::new(
                child.instance_id.clone(),
                child.function_name.clone(),
                child.input.clone(),
                Some(parent.instance_id.clone()),
                now,
            );
            match self.store.create_state(record).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        target: "duratask::scheduler",
                        child_id = %child.instance_id,
                        "child record already exists"
                    );
                }
                Err(e) => {
                    // The parent's scheduled entry is durable but no child
                    // record exists; nothing retries this automatically.
                    warn!(
                        target: "duratask::scheduler",
                        child_id = %child.instance_id,
                        error = %e,
                        "child record creation failed"
                    );
                }
            }
        }
    }

    /// Record a completed child's outcome on its parent and wake it: one CAS
    /// on the parent, retried with fresh reads on conflict.
    async fn wake_parent(
        &self,
        parent_id: &str,
        child_instance_id: &str,
        outcome: &Result<String, FailureDetails>,
    ) {
        for _ in 0..PARENT_WAKE_RETRIES {
            let parent = match self.store.get_state(parent_id).await {
                Ok(Some(parent)) => parent,
                Ok(None) => return, // purged; child is orphaned
                Err(e) => {
                    debug!(target: "duratask::scheduler", parent_id, error = %e, "parent load failed during wake");
                    return;
                }
            };
            if parent.is_completed {
                return;
            }
            let expected = parent.version;
            let mut updated = parent;
            if !crate::providers::record_child_outcome(
                &mut updated,
                child_instance_id,
                outcome,
                now_ms(),
            ) {
                // Entry missing or already terminal; nothing to do.
                return;
            }
            match self.store.save_state(updated, Some(expected)).await {
                Ok(true) => return,
                Ok(false) => continue, // version moved; re-read and retry
                Err(e) => {
                    warn!(target: "duratask::scheduler", parent_id, error = %e, "parent wake failed");
                    return;
                }
            }
        }
        warn!(
            target: "duratask::scheduler",
            parent_id,
            child_instance_id,
            "parent wake exhausted retries under contention"
        );
    }

    /// Release a lease whose version we no longer know (post-conflict). The
    /// fresh read recovers the current version; expiry is the backstop.
    async fn best_effort_release(&self, instance_id: &str) {
        for _ in 0..4 {
            match self.store.get_state(instance_id).await {
                Ok(Some(record))
                    if record.lease_owner.as_deref() == Some(self.options.host_id.as_str()) =>
                {
                    match self
                        .store
                        .release_lease(instance_id, &self.options.host_id, record.version)
                        .await
                    {
                        Ok(true) => return,
                        Ok(false) => continue,
                        Err(_) => return,
                    }
                }
                _ => return,
            }
        }
    }
}
