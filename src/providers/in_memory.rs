//! In-memory state store for tests and examples.
//!
//! One mutex around the whole map makes every operation trivially atomic; the
//! record-level semantics are the shared helpers in the parent module, so this
//! backend behaves identically to the durable ones.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::{now_ms, InstanceRecord};

use super::{
    apply_work_set_to_record, deliver_or_enqueue, lease_claimable, mark_terminated,
    InstanceFilter, ReadyCandidate, StateStore, StoreError, WorkSet,
};

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<HashMap<String, InstanceRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_state(&self, record: InstanceRecord) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(&record.instance_id) {
            return Ok(false);
        }
        g.insert(record.instance_id.clone(), record);
        Ok(true)
    }

    async fn save_state(
        &self,
        record: InstanceRecord,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        if let Some(expected) = expected_version {
            match g.get(&record.instance_id) {
                Some(current) if current.version == expected => {}
                _ => return Ok(false),
            }
        }
        g.insert(record.instance_id.clone(), record);
        Ok(true)
    }

    async fn get_state(&self, instance_id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        Ok(self.inner.lock().await.get(instance_id).cloned())
    }

    async fn get_ready_candidates(
        &self,
        now_ms: u64,
        max: usize,
    ) -> Result<Vec<ReadyCandidate>, StoreError> {
        let g = self.inner.lock().await;
        let mut candidates: Vec<ReadyCandidate> = g
            .values()
            .filter(|r| {
                !r.is_completed
                    && r.execute_after_ms <= now_ms
                    && lease_claimable(&r.lease_owner, r.lease_expires_at_ms, now_ms)
            })
            .map(|r| ReadyCandidate {
                instance_id: r.instance_id.clone(),
                function_name: r.function_name.clone(),
                execute_after_ms: r.execute_after_ms,
                version: r.version,
                lease_owner: r.lease_owner.clone(),
                lease_expires_at_ms: r.lease_expires_at_ms,
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.execute_after_ms
                .cmp(&b.execute_after_ms)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        candidates.truncate(max);
        Ok(candidates)
    }

    async fn try_claim_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        duration: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let now = now_ms();
        let mut g = self.inner.lock().await;
        let record = match g.get_mut(instance_id) {
            Some(r) => r,
            None => return Ok(None),
        };
        if record.is_completed
            || !lease_claimable(&record.lease_owner, record.lease_expires_at_ms, now)
        {
            return Ok(None);
        }
        record.lease_owner = Some(host_id.to_string());
        record.lease_expires_at_ms = Some(now + duration.as_millis() as u64);
        record.version += 1;
        record.updated_at_ms = now;
        Ok(Some(record.version))
    }

    async fn renew_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        duration: Duration,
        expected_version: u64,
    ) -> Result<Option<u64>, StoreError> {
        let now = now_ms();
        let mut g = self.inner.lock().await;
        let record = match g.get_mut(instance_id) {
            Some(r) => r,
            None => return Ok(None),
        };
        if record.lease_owner.as_deref() != Some(host_id) || record.version != expected_version {
            return Ok(None);
        }
        record.lease_expires_at_ms = Some(now + duration.as_millis() as u64);
        record.version += 1;
        record.updated_at_ms = now;
        Ok(Some(record.version))
    }

    async fn release_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut g = self.inner.lock().await;
        let record = match g.get_mut(instance_id) {
            Some(r) => r,
            None => return Ok(false),
        };
        if record.lease_owner.as_deref() != Some(host_id) || record.version != expected_version {
            return Ok(false);
        }
        record.lease_owner = None;
        record.lease_expires_at_ms = None;
        record.version += 1;
        record.updated_at_ms = now;
        Ok(true)
    }

    async fn get_full_state(
        &self,
        instance_id: &str,
        expected_lease_owner: &str,
    ) -> Result<InstanceRecord, StoreError> {
        let now = now_ms();
        let g = self.inner.lock().await;
        let record = g
            .get(instance_id)
            .ok_or_else(|| StoreError::permanent("get_full_state", format!("instance not found: {instance_id}")))?;
        if record.lease_owner.as_deref() != Some(expected_lease_owner) || !record.lease_active(now) {
            return Err(StoreError::permanent(
                "get_full_state",
                format!("lease not held by {expected_lease_owner} for {instance_id}"),
            ));
        }
        Ok(record.clone())
    }

    async fn apply_work_set(
        &self,
        instance_id: &str,
        expected_version: u64,
        work_set: WorkSet,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut g = self.inner.lock().await;
        let record = match g.get_mut(instance_id) {
            Some(r) => r,
            None => return Ok(false),
        };
        if record.version != expected_version || record.is_completed {
            return Ok(false);
        }
        apply_work_set_to_record(record, &work_set, now);
        Ok(true)
    }

    async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        payload: &str,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        let mut g = self.inner.lock().await;
        let record = g.get_mut(instance_id).ok_or_else(|| {
            StoreError::permanent("raise_event", format!("instance not found: {instance_id}"))
        })?;
        if record.is_completed {
            // Raising against a terminal instance is a silent no-op.
            return Ok(());
        }
        deliver_or_enqueue(record, event_name, payload, now);
        Ok(())
    }

    async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), StoreError> {
        let now = now_ms();
        let mut g = self.inner.lock().await;
        let record = g.get_mut(instance_id).ok_or_else(|| {
            StoreError::permanent("terminate", format!("instance not found: {instance_id}"))
        })?;
        if record.is_completed {
            return Ok(());
        }
        mark_terminated(record, reason, now);
        Ok(())
    }

    async fn purge(&self, instance_id: &str) -> Result<u64, StoreError> {
        let mut g = self.inner.lock().await;
        Ok(if g.remove(instance_id).is_some() { 1 } else { 0 })
    }

    async fn count_instances(&self, filter: &InstanceFilter) -> Result<u64, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.values().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<String>, StoreError> {
        let g = self.inner.lock().await;
        let mut ids: Vec<String> = g
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| r.instance_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
