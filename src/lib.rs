//! # Duratask: durable orchestration runtime in Rust
//!
//! Duratask executes user-defined workflows ("orchestrators") that coordinate
//! side-effectful units of work ("activities"), external events, and timers,
//! surviving process restarts and multi-host races. Orchestrators are written as
//! ordinary sequential async code; every external interaction is persisted so
//! that after a crash the orchestrator is replayed deterministically from its
//! history and resumes exactly where it left off.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use duratask::providers::in_memory::InMemoryStore;
//! use duratask::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
//! use duratask::runtime::Runtime;
//! use duratask::{ActivityContext, OrchestrationContext};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Create a state store
//! let store = Arc::new(InMemoryStore::default());
//!
//! // 2. Register activities (your business logic)
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move {
//!         Ok(format!("Hello, {name}!"))
//!     })
//!     .build();
//!
//! // 3. Register orchestrations (your coordination logic)
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorld", |ctx: OrchestrationContext, name: String| async move {
//!         let greeting = ctx.schedule_activity("Greet", name).await?;
//!         Ok(greeting)
//!     })
//!     .build();
//!
//! // 4. Start the runtime and a client
//! let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
//! let client = rt.client();
//! client.start_new_with_id("inst-1", "HelloWorld", "World").await?;
//! let status = client
//!     .wait_for_completion("inst-1", std::time::Duration::from_secs(5))
//!     .await?;
//! println!("{:?}", status.output);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! - **Orchestrations**: coordination logic written as async functions. Every
//!   suspending call (`schedule_activity`, `schedule_sub_orchestration`,
//!   `schedule_timer`, `schedule_wait`) is recorded in durable history.
//! - **Activities**: leaf work units that may perform arbitrary I/O. Executed
//!   at-least-once; idempotent effect comes from deterministic replay.
//! - **Replay**: an orchestrator is never resumed in place. Each pass re-runs
//!   the function from the top against stored history; calls whose outcome is
//!   already recorded return synchronously, the first unrecorded call suspends
//!   the pass.
//! - **Leases**: many hosts poll one shared store. A time-bounded lease keeps at
//!   most one host replaying an instance; a monotone `version` field makes every
//!   commit a compare-and-swap.
//!
//! ## Orchestrations vs Activities
//!
//! Orchestrator code must be deterministic: no wall-clock reads (use
//! [`OrchestrationContext::now_ms`]), no direct I/O, no ambient mutable state,
//! and no awaiting anything the context did not produce. Activities are free to
//! do all of those things.

// Mutex poisoning indicates a panic in another thread - a critical error.
// expect() on mutex locks in this crate is intentional: poisoned state should panic.
#![allow(clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod futures;
mod ids;
pub mod providers;
pub mod runtime;

pub use client::{Client, ClientError, InstanceStatus, StatusOptions};
pub use crate::futures::{
    ActivityFuture, DurableOutput, EventFuture, SubOrchestrationFuture, TimerFuture,
};
pub use providers::{ChildSpec, InstanceFilter, ReadyCandidate, StateStore, StoreError, WorkSet};
pub use runtime::registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder,
};
pub use runtime::{ActivityHandler, OrchestrationHandler, Runtime, RuntimeOptions};

/// Shared reference to a state store implementation.
pub type StoreRef = Arc<dyn StateStore>;

/// `execute_after` sentinel for an instance that is suspended with no due timer.
/// Child completions and event deliveries rewind it to the current time.
pub(crate) const PARKED_EXECUTE_AFTER_MS: u64 = i64::MAX as u64;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// Internal codec for typed input/output (kept private; the public API stays string-based)
pub(crate) mod typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        // A JSON string value is stored raw so plain-string payloads stay readable.
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => {
                // Fallback: treat the raw string as a JSON string value
                let val = Value::String(s.to_string());
                serde_json::from_value(val).map_err(|e| e.to_string())
            }
        }
    }
}

/// Structured error details for terminal instance failures.
///
/// User code only ever observes these as strings (the `Err` side of a call
/// site); the structured form is persisted on the instance record and surfaced
/// through the client status API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code")]
pub enum FailureDetails {
    /// Business-logic failure: an activity or sub-orchestrator returned an
    /// error, or the orchestrator body itself returned one.
    Application { message: String },

    /// No registered function matches the instance's `function_name`.
    Unregistered { function_name: String },

    /// Replay produced a child id that does not match the next history entry.
    /// The orchestrator took a different path than the one that produced its
    /// history; the instance is permanently failed.
    Nondeterminism { message: String },

    /// An external event payload could not be deserialized at the wait site.
    PayloadDecode { message: String },

    /// The instance was terminated by an operator.
    Terminated { reason: String },
}

impl FailureDetails {
    /// Failure category for metrics and logging.
    pub fn category(&self) -> &'static str {
        match self {
            FailureDetails::Application { .. } => "application",
            FailureDetails::Unregistered { .. } => "configuration",
            FailureDetails::Nondeterminism { .. } => "configuration",
            FailureDetails::PayloadDecode { .. } => "application",
            FailureDetails::Terminated { .. } => "terminated",
        }
    }

    /// Display form surfaced to user code at a failed call site.
    pub fn display_message(&self) -> String {
        match self {
            FailureDetails::Application { message } => message.clone(),
            FailureDetails::Unregistered { function_name } => format!("unregistered: {function_name}"),
            FailureDetails::Nondeterminism { message } => format!("nondeterministic: {message}"),
            FailureDetails::PayloadDecode { message } => format!("payload decode: {message}"),
            FailureDetails::Terminated { reason } => format!("terminated: {reason}"),
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, FailureDetails::Terminated { .. })
    }
}

/// Status of a single history entry.
///
/// Entries transition `Scheduled -> Succeeded` or `Scheduled -> Failed`, never
/// back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryStatus {
    Scheduled,
    Succeeded,
    Failed,
}

/// Kind-specific data of a history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum EntryKind {
    /// An activity invocation; a child instance record exists under the
    /// deterministic child id.
    Activity { function_name: String, input: String },

    /// A sub-orchestrator invocation; the child record is an orchestration
    /// instance with its own history.
    SubOrchestration { function_name: String, input: String },

    /// A durable timer that fires at `fire_at_ms`. No child record.
    Timer { fire_at_ms: u64 },

    /// A wait for one externally raised event by name. One entry per wait slot,
    /// consumed FIFO against the per-name event queue.
    External { event_name: String },
}

impl EntryKind {
    fn describe(&self) -> String {
        match self {
            EntryKind::Activity { function_name, .. } => format!("Activity('{function_name}')"),
            EntryKind::SubOrchestration { function_name, .. } => {
                format!("SubOrchestration('{function_name}')")
            }
            EntryKind::Timer { fire_at_ms } => format!("Timer(fire_at={fire_at_ms})"),
            EntryKind::External { event_name } => format!("External('{event_name}')"),
        }
    }
}

/// One durable row in an instance's history: a single suspending call the
/// orchestrator made at a specific point in its code, plus its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Deterministic id of the child call: a hash of the parent id, kind,
    /// callee/event name, input, and the per-parent call ordinal.
    pub child_instance_id: String,

    #[serde(flatten)]
    pub kind: EntryKind,

    pub status: EntryStatus,

    /// Result payload when `Succeeded` (empty for timers).
    pub result: Option<String>,

    /// Structured error when `Failed`.
    pub error: Option<FailureDetails>,

    /// Monitoring only; not semantically load-bearing.
    pub initiated_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

impl HistoryEntry {
    pub fn scheduled(child_instance_id: impl Into<String>, kind: EntryKind, now_ms: u64) -> Self {
        Self {
            child_instance_id: child_instance_id.into(),
            kind,
            status: EntryStatus::Scheduled,
            result: None,
            error: None,
            initiated_at_ms: now_ms,
            completed_at_ms: None,
        }
    }

    pub fn succeed(&mut self, result: Option<String>, now_ms: u64) {
        self.status = EntryStatus::Succeeded;
        self.result = result;
        self.completed_at_ms = Some(now_ms);
    }

    pub fn fail(&mut self, error: FailureDetails, now_ms: u64) {
        self.status = EntryStatus::Failed;
        self.error = Some(error);
        self.completed_at_ms = Some(now_ms);
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, EntryStatus::Scheduled)
    }
}

/// A registered wait for an external event: the slot (history entry) that the
/// next matching `raise_event` will deliver into. Waiters are consumed FIFO.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwaitedEvent {
    pub event_name: String,
    pub slot_id: String,
}

/// Client-facing runtime status, derived from the instance record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

/// The durable record of one orchestration or activity invocation.
///
/// This is the unit of persistence and of atomicity: every mutation is a
/// compare-and-swap on `version`. Backends may split the fields across columns
/// and a serialized blob, as long as the record round-trips losslessly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub function_name: String,
    pub input: String,
    pub parent_instance_id: Option<String>,

    /// Earliest time at which the scheduler may pick this instance.
    pub execute_after_ms: u64,

    /// Insertion-ordered history; child ids are unique per parent.
    pub history: Vec<HistoryEntry>,

    /// Per-name FIFO of delivered event payloads not yet consumed by a wait slot.
    pub event_queues: HashMap<String, VecDeque<String>>,

    /// FIFO of registered wait slots, in replay order.
    pub awaited_events: VecDeque<AwaitedEvent>,

    pub is_completed: bool,
    pub completed_result: Option<String>,
    pub completed_error: Option<FailureDetails>,

    /// Monotone update counter; the CAS token for every write.
    pub version: u64,

    pub lease_owner: Option<String>,
    pub lease_expires_at_ms: Option<u64>,

    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl InstanceRecord {
    pub fn new(
        instance_id: impl Into<String>,
        function_name: impl Into<String>,
        input: impl Into<String>,
        parent_instance_id: Option<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            function_name: function_name.into(),
            input: input.into(),
            parent_instance_id,
            execute_after_ms: now_ms,
            history: Vec::new(),
            event_queues: HashMap::new(),
            awaited_events: VecDeque::new(),
            is_completed: false,
            completed_result: None,
            completed_error: None,
            version: 0,
            lease_owner: None,
            lease_expires_at_ms: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn entry(&self, child_instance_id: &str) -> Option<&HistoryEntry> {
        self.history.iter().find(|e| e.child_instance_id == child_instance_id)
    }

    pub fn entry_mut(&mut self, child_instance_id: &str) -> Option<&mut HistoryEntry> {
        self.history
            .iter_mut()
            .find(|e| e.child_instance_id == child_instance_id)
    }

    /// Whether the lease is currently held (owner set and unexpired).
    pub fn lease_active(&self, now_ms: u64) -> bool {
        match (&self.lease_owner, self.lease_expires_at_ms) {
            (Some(_), Some(expires)) => expires > now_ms,
            _ => false,
        }
    }

    /// Derive the client-facing status.
    pub fn runtime_status(&self) -> RuntimeStatus {
        if self.is_completed {
            match &self.completed_error {
                None => RuntimeStatus::Completed,
                Some(e) if e.is_terminated() => RuntimeStatus::Terminated,
                Some(_) => RuntimeStatus::Failed,
            }
        } else if self.history.is_empty() && self.lease_owner.is_none() {
            RuntimeStatus::Pending
        } else {
            RuntimeStatus::Running
        }
    }
}

/// Declarative decisions produced by one replay pass. The scheduler
/// materializes these into history entries, child records, waiters, and queue
/// consumption via a single work-set commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkAction {
    ScheduleActivity {
        child_id: String,
        function_name: String,
        input: String,
    },
    ScheduleSubOrchestration {
        child_id: String,
        function_name: String,
        input: String,
    },
    ArmTimer {
        child_id: String,
        fire_at_ms: u64,
    },
    AddWaiter {
        child_id: String,
        event_name: String,
    },
    /// A wait slot consumed a payload that was already queued; the entry is
    /// recorded succeeded and the queue head popped at commit.
    ConsumeEvent {
        child_id: String,
        event_name: String,
        payload: String,
    },
}

#[derive(Debug)]
struct CtxInner {
    instance_id: String,
    function_name: String,
    parent_instance_id: Option<String>,
    input: String,

    /// Frozen clock for this pass; identical across replays of the same pass.
    now_ms: u64,

    /// History snapshot the pass replays against.
    history: Vec<HistoryEntry>,
    /// Replay cursor: each suspending call claims the next entry in order.
    cursor: usize,
    /// Watermark for replay-safe logging: entries that existed at pass start.
    baseline_len: usize,

    /// Per-parent call ordinal, advanced on every suspending call.
    next_seq: u64,

    /// Working copy of the pending event queues; new wait slots consume from
    /// the front so multiple slots in one pass drain FIFO.
    pending_queues: HashMap<String, VecDeque<String>>,

    /// Pending actions accumulated before the suspension point.
    actions: Vec<WorkAction>,

    /// First history divergence observed, if any.
    divergence: Option<String>,
}

enum Claim {
    Matched(HistoryEntry),
    New,
    Diverged,
}

impl CtxInner {
    /// Claim the next history entry for a call with the given deterministic id.
    /// Returns the matched entry, `New` when the call is past the end of
    /// history, and records a divergence when the id does not line up.
    fn claim_next(&mut self, child_id: &str, call_desc: &str) -> Claim {
        if self.divergence.is_some() {
            return Claim::Diverged;
        }
        if self.cursor < self.history.len() {
            let entry = &self.history[self.cursor];
            if entry.child_instance_id != child_id {
                self.divergence = Some(format!(
                    "replay expected {call_desc} with id {child_id} but history has {} with id {}",
                    entry.kind.describe(),
                    entry.child_instance_id
                ));
                return Claim::Diverged;
            }
            self.cursor += 1;
            Claim::Matched(self.history[self.cursor - 1].clone())
        } else {
            Claim::New
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn is_replaying(&self) -> bool {
        self.cursor < self.baseline_len
    }
}

/// The API an orchestrator sees: schedule activities, sub-orchestrations,
/// timers, and event waits; read deterministic metadata; emit replay-safe logs.
///
/// Cloning is cheap; the context is shared with every durable future it hands
/// out.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn for_pass(record: &InstanceRecord, now_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner {
                instance_id: record.instance_id.clone(),
                function_name: record.function_name.clone(),
                parent_instance_id: record.parent_instance_id.clone(),
                input: record.input.clone(),
                now_ms,
                baseline_len: record.history.len(),
                history: record.history.clone(),
                cursor: 0,
                next_seq: 0,
                pending_queues: record.event_queues.clone(),
                actions: Vec::new(),
                divergence: None,
            })),
        }
    }

    /// Schedule an activity invocation. Resolves synchronously when the
    /// matching history entry is already terminal; otherwise the pass suspends
    /// here.
    pub fn schedule_activity(
        &self,
        function_name: impl Into<String>,
        input: impl Into<String>,
    ) -> ActivityFuture {
        let function_name = function_name.into();
        let input = input.into();
        let mut inner = self.inner.lock().expect("context mutex poisoned");
        let seq = inner.take_seq();
        let child_id = ids::activity_id(&inner.instance_id, &function_name, &input, seq);
        let outcome = match inner.claim_next(&child_id, &format!("Activity('{function_name}')")) {
            Claim::Matched(entry) => match entry.status {
                EntryStatus::Succeeded => {
                    Some(DurableOutput::Activity(Ok(entry.result.unwrap_or_default())))
                }
                EntryStatus::Failed => Some(DurableOutput::Activity(Err(entry
                    .error
                    .map(|e| e.display_message())
                    .unwrap_or_default()))),
                EntryStatus::Scheduled => None,
            },
            Claim::New => {
                inner.actions.push(WorkAction::ScheduleActivity {
                    child_id,
                    function_name,
                    input,
                });
                None
            }
            Claim::Diverged => None,
        };
        ActivityFuture::new(outcome)
    }

    /// Typed activity call: serializes the input and deserializes the result
    /// through the JSON codec.
    pub async fn schedule_activity_typed<In, Out>(
        &self,
        function_name: impl Into<String>,
        input: &In,
    ) -> Result<Out, String>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let encoded = typed_codec::encode(input)?;
        let raw = self.schedule_activity(function_name, encoded).await?;
        typed_codec::decode(&raw)
    }

    /// Schedule a sub-orchestrator. The child is an orchestration instance with
    /// its own durable history; its terminal result resolves this call.
    pub fn schedule_sub_orchestration(
        &self,
        function_name: impl Into<String>,
        input: impl Into<String>,
    ) -> SubOrchestrationFuture {
        let function_name = function_name.into();
        let input = input.into();
        let mut inner = self.inner.lock().expect("context mutex poisoned");
        let seq = inner.take_seq();
        let child_id = ids::sub_orchestration_id(&inner.instance_id, &function_name, &input, seq);
        let outcome = match inner.claim_next(&child_id, &format!("SubOrchestration('{function_name}')"))
        {
            Claim::Matched(entry) => match entry.status {
                EntryStatus::Succeeded => Some(DurableOutput::SubOrchestration(Ok(entry
                    .result
                    .unwrap_or_default()))),
                EntryStatus::Failed => Some(DurableOutput::SubOrchestration(Err(entry
                    .error
                    .map(|e| e.display_message())
                    .unwrap_or_default()))),
                EntryStatus::Scheduled => None,
            },
            Claim::New => {
                inner.actions.push(WorkAction::ScheduleSubOrchestration {
                    child_id,
                    function_name,
                    input,
                });
                None
            }
            Claim::Diverged => None,
        };
        SubOrchestrationFuture::new(outcome)
    }

    /// Typed sub-orchestrator call through the JSON codec.
    pub async fn schedule_sub_orchestration_typed<In, Out>(
        &self,
        function_name: impl Into<String>,
        input: &In,
    ) -> Result<Out, String>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let encoded = typed_codec::encode(input)?;
        let raw = self.schedule_sub_orchestration(function_name, encoded).await?;
        typed_codec::decode(&raw)
    }

    /// Create a durable timer. The absolute fire time is derived from the
    /// frozen replay clock, so the computation is stable across replays.
    pub fn schedule_timer(&self, delay: std::time::Duration) -> TimerFuture {
        let mut inner = self.inner.lock().expect("context mutex poisoned");
        let fire_at_ms = inner.now_ms.saturating_add(delay.as_millis() as u64);
        let seq = inner.take_seq();
        let child_id = ids::timer_id(&inner.instance_id, seq);
        let outcome = match inner.claim_next(&child_id, "Timer") {
            Claim::Matched(entry) => match entry.status {
                EntryStatus::Succeeded => Some(DurableOutput::Timer),
                _ => None,
            },
            Claim::New => {
                inner.actions.push(WorkAction::ArmTimer { child_id, fire_at_ms });
                None
            }
            Claim::Diverged => None,
        };
        TimerFuture::new(outcome)
    }

    /// Wait for one externally raised event by name. Each call creates a new
    /// slot; slots are consumed FIFO against the per-name queue, so awaiting
    /// the same event k times requires k raises.
    pub fn schedule_wait(&self, event_name: impl Into<String>) -> EventFuture {
        let event_name = event_name.into();
        let mut inner = self.inner.lock().expect("context mutex poisoned");
        let seq = inner.take_seq();
        let child_id = ids::event_slot_id(&inner.instance_id, &event_name, seq);
        let outcome = match inner.claim_next(&child_id, &format!("External('{event_name}')")) {
            Claim::Matched(entry) => match entry.status {
                EntryStatus::Succeeded => {
                    Some(DurableOutput::External(entry.result.unwrap_or_default()))
                }
                _ => None,
            },
            Claim::New => {
                let queued = inner
                    .pending_queues
                    .get_mut(&event_name)
                    .and_then(|q| q.pop_front());
                match queued {
                    Some(payload) => {
                        inner.actions.push(WorkAction::ConsumeEvent {
                            child_id,
                            event_name,
                            payload: payload.clone(),
                        });
                        Some(DurableOutput::External(payload))
                    }
                    None => {
                        inner.actions.push(WorkAction::AddWaiter { child_id, event_name });
                        None
                    }
                }
            }
            Claim::Diverged => None,
        };
        EventFuture::new(outcome)
    }

    /// Typed event wait. A payload that fails to decode surfaces as an `Err` of
    /// this call site, like a user error from a child.
    pub async fn schedule_wait_typed<T: serde::de::DeserializeOwned>(
        &self,
        event_name: impl Into<String>,
    ) -> Result<T, String> {
        let raw = self.schedule_wait(event_name).await;
        typed_codec::decode(&raw).map_err(|e| {
            FailureDetails::PayloadDecode { message: e }.display_message()
        })
    }

    /// Await a set of durable futures; outputs come back in input order.
    ///
    /// This is the deterministic fan-in primitive. There is deliberately no
    /// racing counterpart: history records no completion order, so a race
    /// winner could change across replays.
    pub async fn join<F: std::future::Future + Unpin>(&self, futures: Vec<F>) -> Vec<F::Output> {
        ::futures::future::join_all(futures).await
    }

    // ===== Deterministic helpers =====

    /// The frozen clock for this replay pass, in epoch milliseconds. Identical
    /// across replays of the same pass; safe to branch on.
    pub fn now_ms(&self) -> u64 {
        self.inner.lock().expect("context mutex poisoned").now_ms
    }

    pub fn instance_id(&self) -> String {
        self.inner.lock().expect("context mutex poisoned").instance_id.clone()
    }

    pub fn parent_instance_id(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("context mutex poisoned")
            .parent_instance_id
            .clone()
    }

    pub fn function_name(&self) -> String {
        self.inner.lock().expect("context mutex poisoned").function_name.clone()
    }

    /// The raw serialized input.
    pub fn input_raw(&self) -> String {
        self.inner.lock().expect("context mutex poisoned").input.clone()
    }

    /// Deserialize the instance input through the JSON codec.
    pub fn input<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        let raw = self.input_raw();
        typed_codec::decode(&raw)
    }

    /// True while the pass is re-executing decisions that are already in
    /// history. Useful for guarding side effects in user code.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().expect("context mutex poisoned").is_replaying()
    }

    // ===== Replay-safe tracing =====
    //
    // Emissions are dropped while the replay cursor is inside previously
    // persisted history, so a log line appears exactly once per decision point
    // across any number of replays.

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message.into());
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace("DEBUG", message.into());
    }

    fn trace(&self, level: &str, message: String) {
        let (replaying, instance_id, function_name) = {
            let inner = self.inner.lock().expect("context mutex poisoned");
            (
                inner.is_replaying(),
                inner.instance_id.clone(),
                inner.function_name.clone(),
            )
        };
        if replaying {
            return;
        }
        match level {
            "ERROR" => tracing::error!(
                target: "duratask::orchestration",
                instance_id = %instance_id,
                function_name = %function_name,
                "{message}"
            ),
            "WARN" => tracing::warn!(
                target: "duratask::orchestration",
                instance_id = %instance_id,
                function_name = %function_name,
                "{message}"
            ),
            "DEBUG" => tracing::debug!(
                target: "duratask::orchestration",
                instance_id = %instance_id,
                function_name = %function_name,
                "{message}"
            ),
            _ => tracing::info!(
                target: "duratask::orchestration",
                instance_id = %instance_id,
                function_name = %function_name,
                "{message}"
            ),
        }
    }

    // ===== Executor hooks =====

    /// Drain the pending actions accumulated by this pass.
    #[doc(hidden)]
    pub fn drain_actions(&self) -> Vec<WorkAction> {
        std::mem::take(&mut self.inner.lock().expect("context mutex poisoned").actions)
    }

    /// The first history divergence observed by this pass, if any.
    #[doc(hidden)]
    pub fn divergence(&self) -> Option<String> {
        self.inner.lock().expect("context mutex poisoned").divergence.clone()
    }
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("context mutex poisoned");
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &inner.instance_id)
            .field("function_name", &inner.function_name)
            .field("cursor", &inner.cursor)
            .field("next_seq", &inner.next_seq)
            .finish()
    }
}

/// Context provided to activities for logging, metadata access, and cooperative
/// cancellation.
///
/// Unlike [`OrchestrationContext`], activities are leaf nodes that cannot
/// schedule new durable work, but they often need structured logs with
/// correlation fields and a way to notice that their lease is gone.
#[derive(Clone)]
pub struct ActivityContext {
    instance_id: String,
    function_name: String,
    parent_instance_id: Option<String>,
    host_id: String,
    cancellation_token: tokio_util::sync::CancellationToken,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: String,
        function_name: String,
        parent_instance_id: Option<String>,
        host_id: String,
        cancellation_token: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            instance_id,
            function_name,
            parent_instance_id,
            host_id,
            cancellation_token,
        }
    }

    /// This activity invocation's own instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// The orchestration instance awaiting this activity's result.
    pub fn parent_instance_id(&self) -> Option<&str> {
        self.parent_instance_id.as_deref()
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// True once the executing host's lease on this invocation has been lost.
    /// Long-running activities should stop work; the result would be discarded.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Completes when cancellation is requested; for use with `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }

    /// Token clone for tasks this activity spawns itself.
    pub fn cancellation_token(&self) -> tokio_util::sync::CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "duratask::activity",
            instance_id = %self.instance_id,
            function_name = %self.function_name,
            host_id = %self.host_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "duratask::activity",
            instance_id = %self.instance_id,
            function_name = %self.function_name,
            host_id = %self.host_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "duratask::activity",
            instance_id = %self.instance_id,
            function_name = %self.function_name,
            host_id = %self.host_id,
            "{}",
            message.into()
        );
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("instance_id", &self.instance_id)
            .field("function_name", &self.function_name)
            .field("parent_instance_id", &self.parent_instance_id)
            .field("host_id", &self.host_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_status_derivation() {
        let now = now_ms();
        let mut rec = InstanceRecord::new("i", "F", "", None, now);
        assert_eq!(rec.runtime_status(), RuntimeStatus::Pending);

        rec.history
            .push(HistoryEntry::scheduled("c1", EntryKind::Timer { fire_at_ms: now }, now));
        assert_eq!(rec.runtime_status(), RuntimeStatus::Running);

        rec.is_completed = true;
        rec.completed_result = Some("out".into());
        assert_eq!(rec.runtime_status(), RuntimeStatus::Completed);

        rec.completed_result = None;
        rec.completed_error = Some(FailureDetails::Application { message: "boom".into() });
        assert_eq!(rec.runtime_status(), RuntimeStatus::Failed);

        rec.completed_error = Some(FailureDetails::Terminated { reason: "user".into() });
        assert_eq!(rec.runtime_status(), RuntimeStatus::Terminated);
    }

    #[test]
    fn record_round_trips_through_json() {
        let now = now_ms();
        let mut rec = InstanceRecord::new("i1", "Orch", "\"in\"", Some("parent".into()), now);
        rec.history.push(HistoryEntry::scheduled(
            "child-a",
            EntryKind::Activity {
                function_name: "F".into(),
                input: "x".into(),
            },
            now,
        ));
        rec.event_queues
            .entry("E".to_string())
            .or_default()
            .push_back("payload".into());
        rec.awaited_events.push_back(AwaitedEvent {
            event_name: "E".into(),
            slot_id: "slot-1".into(),
        });
        rec.lease_owner = Some("host-1".into());
        rec.lease_expires_at_ms = Some(now + 1000);

        let json = serde_json::to_string(&rec).unwrap();
        let back: InstanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }

    #[test]
    fn failed_entry_surfaces_display_message() {
        let now = now_ms();
        let mut entry = HistoryEntry::scheduled(
            "c",
            EntryKind::Activity {
                function_name: "F".into(),
                input: String::new(),
            },
            now,
        );
        entry.fail(FailureDetails::Application { message: "boom".into() }, now);
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.error.as_ref().unwrap().display_message(), "boom");
    }
}
