//! Instrumented store wrapper that adds state-layer spans and latency metrics
//! to any [`StateStore`] implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::Instrument;

use crate::runtime::observability::ObservabilityHandle;
use crate::InstanceRecord;

use super::{InstanceFilter, ReadyCandidate, StateStore, StoreError, WorkSet};

/// Decorator recording save/load latency histograms, the events-raised
/// counter, and a named span per state operation.
///
/// ```rust,ignore
/// let store: Arc<dyn StateStore> = Arc::new(InstrumentedStore::new(inner, observability));
/// ```
pub struct InstrumentedStore {
    inner: Arc<dyn StateStore>,
    observability: Arc<ObservabilityHandle>,
}

impl InstrumentedStore {
    pub fn new(inner: Arc<dyn StateStore>, observability: Arc<ObservabilityHandle>) -> Self {
        Self {
            inner,
            observability,
        }
    }

    fn record_save(&self, elapsed: Duration) {
        self.observability
            .record_state_save_ms(elapsed.as_millis() as u64);
    }

    fn record_load(&self, elapsed: Duration) {
        self.observability
            .record_state_load_ms(elapsed.as_millis() as u64);
    }
}

#[async_trait]
impl StateStore for InstrumentedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_state(&self, record: InstanceRecord) -> Result<bool, StoreError> {
        let span = tracing::debug_span!(target: "duratask::store", "state_save", instance_id = %record.instance_id, op = "create");
        let start = Instant::now();
        let result = self.inner.create_state(record).instrument(span).await;
        self.record_save(start.elapsed());
        result
    }

    async fn save_state(
        &self,
        record: InstanceRecord,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let span = tracing::debug_span!(target: "duratask::store", "state_save", instance_id = %record.instance_id, op = "save");
        let start = Instant::now();
        let result = self.inner.save_state(record, expected_version).instrument(span).await;
        self.record_save(start.elapsed());
        result
    }

    async fn get_state(&self, instance_id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        let span = tracing::debug_span!(target: "duratask::store", "state_load", instance_id, op = "get");
        let start = Instant::now();
        let result = self.inner.get_state(instance_id).instrument(span).await;
        self.record_load(start.elapsed());
        result
    }

    async fn get_ready_candidates(
        &self,
        now_ms: u64,
        max: usize,
    ) -> Result<Vec<ReadyCandidate>, StoreError> {
        self.inner.get_ready_candidates(now_ms, max).await
    }

    async fn try_claim_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        duration: Duration,
    ) -> Result<Option<u64>, StoreError> {
        self.inner.try_claim_lease(instance_id, host_id, duration).await
    }

    async fn renew_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        duration: Duration,
        expected_version: u64,
    ) -> Result<Option<u64>, StoreError> {
        self.inner
            .renew_lease(instance_id, host_id, duration, expected_version)
            .await
    }

    async fn release_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.inner
            .release_lease(instance_id, host_id, expected_version)
            .await
    }

    async fn get_full_state(
        &self,
        instance_id: &str,
        expected_lease_owner: &str,
    ) -> Result<InstanceRecord, StoreError> {
        let span = tracing::debug_span!(target: "duratask::store", "state_load", instance_id, op = "get_full");
        let start = Instant::now();
        let result = self
            .inner
            .get_full_state(instance_id, expected_lease_owner)
            .instrument(span)
            .await;
        self.record_load(start.elapsed());
        result
    }

    async fn apply_work_set(
        &self,
        instance_id: &str,
        expected_version: u64,
        work_set: WorkSet,
    ) -> Result<bool, StoreError> {
        let span = tracing::debug_span!(target: "duratask::store", "state_save", instance_id, op = "apply_work_set");
        let start = Instant::now();
        let result = self
            .inner
            .apply_work_set(instance_id, expected_version, work_set)
            .instrument(span)
            .await;
        self.record_save(start.elapsed());
        result
    }

    async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        payload: &str,
    ) -> Result<(), StoreError> {
        let span = tracing::debug_span!(target: "duratask::store", "event_raise", instance_id, event_name);
        let result = self
            .inner
            .raise_event(instance_id, event_name, payload)
            .instrument(span)
            .await;
        if result.is_ok() {
            self.observability.record_event_raised();
        }
        result
    }

    async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), StoreError> {
        let span = tracing::debug_span!(target: "duratask::store", "state_save", instance_id, op = "terminate");
        self.inner.terminate(instance_id, reason).instrument(span).await
    }

    async fn purge(&self, instance_id: &str) -> Result<u64, StoreError> {
        let span = tracing::debug_span!(target: "duratask::store", "state_remove", instance_id);
        self.inner.purge(instance_id).instrument(span).await
    }

    async fn count_instances(&self, filter: &InstanceFilter) -> Result<u64, StoreError> {
        self.inner.count_instances(filter).await
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<String>, StoreError> {
        self.inner.list_instances(filter).await
    }
}
