//! The replay executor: one pass of a user orchestrator over its history.
//!
//! A pass is a pure function of `(record, handler, now)`. It fires due timers
//! into a working copy, builds a fresh context, and polls the handler's future
//! exactly once with a noop waker. Durable futures resolve synchronously from
//! the history snapshot, so a single poll drives user code to its next
//! suspension or to completion; `Poll::Pending` reaching the root is the
//! suspension signal. Running the executor twice without an intervening commit
//! produces identical work sets.

use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::debug;

use crate::providers::{ChildSpec, WorkSet};
use crate::runtime::OrchestrationHandler;
use crate::{
    AwaitedEvent, EntryKind, EntryStatus, FailureDetails, HistoryEntry, InstanceRecord,
    OrchestrationContext, WorkAction, PARKED_EXECUTE_AFTER_MS,
};

/// Transition timer entries that are due at `now_ms` in the working copy.
/// Returns the fired child ids; the same transitions join the work set so the
/// commit makes them durable.
pub fn fire_due_timers(record: &mut InstanceRecord, now_ms: u64) -> Vec<String> {
    let mut fired = Vec::new();
    for entry in record.history.iter_mut() {
        if entry.status != EntryStatus::Scheduled {
            continue;
        }
        if let EntryKind::Timer { fire_at_ms } = entry.kind {
            if fire_at_ms <= now_ms {
                entry.succeed(None, now_ms);
                fired.push(entry.child_instance_id.clone());
            }
        }
    }
    fired
}

/// Run the registered orchestrator once to its next suspension or completion
/// and return the work set that advances the instance when committed.
pub fn run_orchestration_pass(
    record: &InstanceRecord,
    handler: Arc<dyn OrchestrationHandler>,
    now_ms: u64,
) -> WorkSet {
    let mut working = record.clone();
    let fired_timers = fire_due_timers(&mut working, now_ms);

    let ctx = OrchestrationContext::for_pass(&working, now_ms);
    let completion = {
        let mut fut = handler.invoke(ctx.clone(), working.input.clone());
        let waker = ::futures::task::noop_waker();
        let mut poll_cx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut poll_cx) {
            Poll::Ready(Ok(output)) => Some(Ok(output)),
            Poll::Ready(Err(message)) => Some(Err(FailureDetails::Application { message })),
            Poll::Pending => None,
        }
    };

    let actions = ctx.drain_actions();

    if let Some(message) = ctx.divergence() {
        // A diverged pass must not schedule anything: the history no longer
        // describes this code. The instance fails permanently and is never
        // re-executed.
        debug!(
            target: "duratask::replay",
            instance_id = %record.instance_id,
            "history divergence: {message}"
        );
        return WorkSet {
            fired_timers,
            completion: Some(Err(FailureDetails::Nondeterminism { message })),
            release_lease: true,
            ..Default::default()
        };
    }

    let mut ws = WorkSet {
        fired_timers,
        release_lease: true,
        ..Default::default()
    };

    for action in actions {
        match action {
            WorkAction::ScheduleActivity {
                child_id,
                function_name,
                input,
            } => {
                ws.new_entries.push(HistoryEntry::scheduled(
                    child_id.clone(),
                    EntryKind::Activity {
                        function_name: function_name.clone(),
                        input: input.clone(),
                    },
                    now_ms,
                ));
                ws.children.push(ChildSpec {
                    instance_id: child_id,
                    function_name,
                    input,
                });
            }
            WorkAction::ScheduleSubOrchestration {
                child_id,
                function_name,
                input,
            } => {
                ws.new_entries.push(HistoryEntry::scheduled(
                    child_id.clone(),
                    EntryKind::SubOrchestration {
                        function_name: function_name.clone(),
                        input: input.clone(),
                    },
                    now_ms,
                ));
                ws.children.push(ChildSpec {
                    instance_id: child_id,
                    function_name,
                    input,
                });
            }
            WorkAction::ArmTimer { child_id, fire_at_ms } => {
                ws.new_entries.push(HistoryEntry::scheduled(
                    child_id,
                    EntryKind::Timer { fire_at_ms },
                    now_ms,
                ));
            }
            WorkAction::AddWaiter { child_id, event_name } => {
                ws.new_entries.push(HistoryEntry::scheduled(
                    child_id.clone(),
                    EntryKind::External {
                        event_name: event_name.clone(),
                    },
                    now_ms,
                ));
                ws.new_waiters.push(AwaitedEvent {
                    event_name,
                    slot_id: child_id,
                });
            }
            WorkAction::ConsumeEvent {
                child_id,
                event_name,
                payload,
            } => {
                let mut entry = HistoryEntry::scheduled(
                    child_id,
                    EntryKind::External {
                        event_name: event_name.clone(),
                    },
                    now_ms,
                );
                entry.succeed(Some(payload), now_ms);
                ws.new_entries.push(entry);
                ws.consumed_events.push(event_name);
            }
        }
    }

    ws.completion = completion;

    if ws.completion.is_none() {
        // Park until the earliest still-scheduled timer; children and events
        // rewind execute_after when they arrive.
        let mut next_due = PARKED_EXECUTE_AFTER_MS;
        for entry in working.history.iter().chain(ws.new_entries.iter()) {
            if entry.status != EntryStatus::Scheduled {
                continue;
            }
            if let EntryKind::Timer { fire_at_ms } = entry.kind {
                next_due = next_due.min(fire_at_ms);
            }
        }
        ws.execute_after_ms = Some(next_due);
    }

    ws
}
