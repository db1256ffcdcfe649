//! Control-plane client for management surfaces: start, status, raise-event,
//! terminate, purge, list/count, and completion waiting.
//!
//! The client talks to the runtime only through the shared store, so it can be
//! used from any process, including ones without a running worker host.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::providers::{InstanceFilter, StateStore, StoreError};
use crate::{
    now_ms, typed_codec, FailureDetails, HistoryEntry, InstanceRecord, RuntimeStatus,
};

// Polling behavior for wait_for_completion
const INITIAL_POLL_DELAY_MS: u64 = 5;
const MAX_POLL_DELAY_MS: u64 = 100;
const POLL_DELAY_MULTIPLIER: u64 = 2;

/// Client-specific error wrapping store failures and local validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Store operation failed.
    Store(StoreError),

    /// An instance with this id already exists.
    InstanceAlreadyExists { instance_id: String },

    /// The instance does not exist.
    InstanceNotFound { instance_id: String },

    /// Payload exceeds the configured input-size limit.
    InputTooLarge { size: usize, limit: usize },

    /// Invalid input (client-side validation).
    InvalidInput { message: String },

    /// A wait operation timed out.
    Timeout,
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Store(e) => e.is_retryable(),
            ClientError::Timeout => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Store(e) => write!(f, "{e}"),
            ClientError::InstanceAlreadyExists { instance_id } => {
                write!(f, "instance {instance_id} already exists")
            }
            ClientError::InstanceNotFound { instance_id } => {
                write!(f, "instance {instance_id} not found")
            }
            ClientError::InputTooLarge { size, limit } => {
                write!(f, "payload of {size} bytes exceeds limit of {limit} bytes")
            }
            ClientError::InvalidInput { message } => write!(f, "invalid input: {message}"),
            ClientError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::Store(e)
    }
}

/// Options controlling which payloads a status query returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOptions {
    pub include_input: bool,
    pub include_output: bool,
    pub include_history: bool,
}

impl StatusOptions {
    pub fn all() -> Self {
        Self {
            include_input: true,
            include_output: true,
            include_history: true,
        }
    }
}

/// Snapshot of one instance for management surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub function_name: String,
    pub runtime_status: RuntimeStatus,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<FailureDetails>,
    pub history: Option<Vec<HistoryEntry>>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl InstanceStatus {
    fn from_record(record: InstanceRecord, options: StatusOptions) -> Self {
        Self {
            runtime_status: record.runtime_status(),
            instance_id: record.instance_id,
            function_name: record.function_name,
            input: options.include_input.then_some(record.input),
            output: if options.include_output {
                record.completed_result
            } else {
                None
            },
            error: record.completed_error,
            history: options.include_history.then_some(record.history),
            created_at_ms: record.created_at_ms,
            updated_at_ms: record.updated_at_ms,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.runtime_status,
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated
        )
    }
}

/// Client for orchestration control-plane operations.
///
/// `Clone` and cheap to share across tasks.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn StateStore>,
    max_input_size: usize,
}

impl Client {
    /// Create a client bound to a store (the same instance the runtime uses).
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            max_input_size: 1024 * 1024,
        }
    }

    /// Override the input-size limit applied to starts and raised events.
    pub fn with_max_input_size(mut self, max_input_size: usize) -> Self {
        self.max_input_size = max_input_size;
        self
    }

    fn check_payload(&self, operation: &str, payload: &str) -> Result<(), ClientError> {
        if payload.len() > self.max_input_size {
            info!(
                target: "duratask::client",
                operation,
                size = payload.len(),
                limit = self.max_input_size,
                "payload rejected"
            );
            return Err(ClientError::InputTooLarge {
                size: payload.len(),
                limit: self.max_input_size,
            });
        }
        Ok(())
    }

    /// Start a new orchestration instance under a generated id, which is
    /// returned. The scheduler picks the instance up on its next cycle.
    pub async fn start_new(
        &self,
        function_name: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let instance_id = generate_instance_id();
        self.start_new_with_id(instance_id.clone(), function_name, input)
            .await?;
        Ok(instance_id)
    }

    /// Start a new orchestration instance under a caller-chosen id.
    /// Ids must be unique; reuse is rejected.
    pub async fn start_new_with_id(
        &self,
        instance_id: impl Into<String>,
        function_name: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        let instance_id = instance_id.into();
        let function_name = function_name.into();
        let input = input.into();
        if instance_id.is_empty() {
            return Err(ClientError::InvalidInput {
                message: "instance id must not be empty".into(),
            });
        }
        self.check_payload("start_new", &input)?;

        let record = InstanceRecord::new(
            instance_id.clone(),
            function_name.clone(),
            input,
            None,
            now_ms(),
        );
        let created = self.store.create_state(record).await?;
        if !created {
            return Err(ClientError::InstanceAlreadyExists { instance_id });
        }
        info!(
            target: "duratask::client",
            instance_id = %instance_id,
            function_name = %function_name,
            "orchestration started"
        );
        Ok(())
    }

    /// Typed start: the input is serialized through the JSON codec.
    pub async fn start_new_typed<In: Serialize>(
        &self,
        instance_id: impl Into<String>,
        function_name: impl Into<String>,
        input: &In,
    ) -> Result<(), ClientError> {
        let encoded = typed_codec::encode(input)
            .map_err(|message| ClientError::InvalidInput { message })?;
        self.start_new_with_id(instance_id, function_name, encoded).await
    }

    /// Read an instance's status. Returns `None` for unknown ids.
    pub async fn get_status(
        &self,
        instance_id: &str,
        options: StatusOptions,
    ) -> Result<Option<InstanceStatus>, ClientError> {
        let record = self.store.get_state(instance_id).await?;
        Ok(record.map(|r| InstanceStatus::from_record(r, options)))
    }

    /// Raise an external event: delivered to the earliest waiter for
    /// `event_name` or queued for the next wait slot. Raising against a
    /// completed instance is a silent no-op.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        event_name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        let event_name = event_name.into();
        let payload = payload.into();
        self.check_payload("raise_event", &payload)?;
        self.store
            .raise_event(instance_id, &event_name, &payload)
            .await?;
        info!(
            target: "duratask::client",
            instance_id,
            event_name = %event_name,
            "event raised"
        );
        Ok(())
    }

    /// Typed raise through the JSON codec.
    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance_id: &str,
        event_name: impl Into<String>,
        payload: &T,
    ) -> Result<(), ClientError> {
        let encoded = typed_codec::encode(payload)
            .map_err(|message| ClientError::InvalidInput { message })?;
        self.raise_event(instance_id, event_name, encoded).await
    }

    /// Terminate an instance: a durable transition to completed-failed with a
    /// distinct `Terminated` error code. In-flight work on other hosts is not
    /// interrupted; its commit loses the version CAS instead.
    pub async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), ClientError> {
        self.store.terminate(instance_id, reason).await?;
        info!(target: "duratask::client", instance_id, reason, "instance terminated");
        Ok(())
    }

    /// Delete an instance record. Children of a purged parent are orphaned.
    /// Returns the number of records deleted.
    pub async fn purge_instance(&self, instance_id: &str) -> Result<u64, ClientError> {
        let deleted = self.store.purge(instance_id).await?;
        info!(target: "duratask::client", instance_id, deleted, "instance purged");
        Ok(deleted)
    }

    pub async fn count_instances(&self, filter: &InstanceFilter) -> Result<u64, ClientError> {
        Ok(self.store.count_instances(filter).await?)
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances(filter).await?)
    }

    /// Poll until the instance reaches a terminal status or the timeout
    /// elapses. Backoff grows from 5 ms to 100 ms between polls.
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = INITIAL_POLL_DELAY_MS;
        loop {
            if let Some(status) = self
                .get_status(instance_id, StatusOptions::all())
                .await?
            {
                if status.is_terminal() {
                    return Ok(status);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay = (delay * POLL_DELAY_MULTIPLIER).min(MAX_POLL_DELAY_MS);
        }
    }
}

fn generate_instance_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("inst-{nanos:x}-{counter:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryStore;

    fn client() -> Client {
        Client::new(Arc::new(InMemoryStore::default()))
    }

    #[tokio::test]
    async fn duplicate_instance_ids_are_rejected() {
        let client = client();
        client.start_new_with_id("i1", "O", "").await.unwrap();
        let err = client.start_new_with_id("i1", "O", "").await.unwrap_err();
        assert_eq!(
            err,
            ClientError::InstanceAlreadyExists { instance_id: "i1".into() }
        );
    }

    #[tokio::test]
    async fn oversized_payloads_are_rejected() {
        let client = client().with_max_input_size(8);
        let err = client
            .start_new_with_id("i1", "O", "123456789")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InputTooLarge { size: 9, limit: 8 }));

        client.start_new_with_id("i2", "O", "ok").await.unwrap();
        let err = client.raise_event("i2", "E", "123456789").await.unwrap_err();
        assert!(matches!(err, ClientError::InputTooLarge { .. }));
    }

    #[tokio::test]
    async fn status_respects_payload_options() {
        let client = client();
        client.start_new_with_id("i1", "O", "the-input").await.unwrap();

        let bare = client
            .get_status("i1", StatusOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bare.runtime_status, RuntimeStatus::Pending);
        assert!(bare.input.is_none());
        assert!(bare.history.is_none());

        let full = client.get_status("i1", StatusOptions::all()).await.unwrap().unwrap();
        assert_eq!(full.input.as_deref(), Some("the-input"));
        assert_eq!(full.history.as_deref(), Some(&[] as &[HistoryEntry]));
    }

    #[tokio::test]
    async fn generated_ids_are_unique() {
        let client = client();
        let a = client.start_new("O", "").await.unwrap();
        let b = client.start_new("O", "").await.unwrap();
        assert_ne!(a, b);
    }
}
