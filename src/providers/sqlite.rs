//! SQLite-backed state store.
//!
//! Layout: one `instances` table holding the CAS and polling fields as columns
//! (so the candidate scan is an indexed query) and the full record as a JSON
//! blob. Every write is `UPDATE .. WHERE instance_id = ? AND version = ?` with
//! a rows-affected check, which is all the atomicity the store contract needs:
//! no cross-record transactions, single-row CAS only.
//!
//! The columns are authoritative for the fields they mirror; reads reconcile
//! the parsed blob against them so column-only writes (lease claims, renews)
//! never leave a stale blob visible.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::{now_ms, InstanceRecord};

use super::{
    apply_work_set_to_record, deliver_or_enqueue, mark_terminated, InstanceFilter, ReadyCandidate,
    StateStore, StoreError, WorkSet,
};

/// Bounded retry for read-modify-write operations that race other writers
/// (raise_event, terminate). Conflicts are re-read, not surfaced.
const CAS_RETRY_LIMIT: usize = 16;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if missing) a SQLite database at `database_url`,
    /// e.g. `sqlite:./data.db`.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps the database
    /// alive and shared.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                function_name TEXT NOT NULL,
                parent_instance_id TEXT,
                execute_after INTEGER NOT NULL,
                is_completed INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                record TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_ready ON instances(is_completed, execute_after)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_lease ON instances(lease_owner, lease_expires_at)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_parent ON instances(parent_instance_id)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn err(operation: &str, e: sqlx::Error) -> StoreError {
        StoreError::retryable(operation, e.to_string())
    }

    /// Parse the record blob, then overwrite the mirrored fields from columns.
    fn row_to_record(operation: &str, row: &sqlx::sqlite::SqliteRow) -> Result<InstanceRecord, StoreError> {
        let blob: String = row
            .try_get("record")
            .map_err(|e| Self::err(operation, e))?;
        let mut record: InstanceRecord = serde_json::from_str(&blob)
            .map_err(|e| StoreError::permanent(operation, format!("corrupt record blob: {e}")))?;

        let version: i64 = row.try_get("version").map_err(|e| Self::err(operation, e))?;
        let execute_after: i64 = row
            .try_get("execute_after")
            .map_err(|e| Self::err(operation, e))?;
        let is_completed: i64 = row
            .try_get("is_completed")
            .map_err(|e| Self::err(operation, e))?;
        let lease_owner: Option<String> = row
            .try_get("lease_owner")
            .map_err(|e| Self::err(operation, e))?;
        let lease_expires_at: Option<i64> = row
            .try_get("lease_expires_at")
            .map_err(|e| Self::err(operation, e))?;
        let updated_at: i64 = row.try_get("updated_at").map_err(|e| Self::err(operation, e))?;

        record.version = version as u64;
        record.execute_after_ms = execute_after as u64;
        record.is_completed = is_completed != 0;
        record.lease_owner = lease_owner;
        record.lease_expires_at_ms = lease_expires_at.map(|v| v as u64);
        record.updated_at_ms = updated_at as u64;
        Ok(record)
    }

    async fn load(&self, operation: &str, instance_id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::err(operation, e))?;
        match row {
            Some(row) => Ok(Some(Self::row_to_record(operation, &row)?)),
            None => Ok(None),
        }
    }

    /// Write the full record. With `expected_version`, a single-row CAS.
    async fn write_full(
        &self,
        operation: &str,
        record: &InstanceRecord,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let blob = serde_json::to_string(record)
            .map_err(|e| StoreError::permanent(operation, format!("serialize record: {e}")))?;

        let result = match expected_version {
            Some(expected) => sqlx::query(
                r#"
                UPDATE instances
                SET function_name = ?, parent_instance_id = ?, execute_after = ?,
                    is_completed = ?, version = ?, lease_owner = ?, lease_expires_at = ?,
                    updated_at = ?, record = ?
                WHERE instance_id = ? AND version = ?
                "#,
            )
            .bind(&record.function_name)
            .bind(record.parent_instance_id.as_deref())
            .bind(record.execute_after_ms as i64)
            .bind(record.is_completed as i64)
            .bind(record.version as i64)
            .bind(record.lease_owner.as_deref())
            .bind(record.lease_expires_at_ms.map(|v| v as i64))
            .bind(record.updated_at_ms as i64)
            .bind(&blob)
            .bind(&record.instance_id)
            .bind(expected as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::err(operation, e))?,
            None => sqlx::query(
                r#"
                INSERT INTO instances (instance_id, function_name, parent_instance_id,
                    execute_after, is_completed, version, lease_owner, lease_expires_at,
                    created_at, updated_at, record)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(instance_id) DO UPDATE SET
                    function_name = excluded.function_name,
                    parent_instance_id = excluded.parent_instance_id,
                    execute_after = excluded.execute_after,
                    is_completed = excluded.is_completed,
                    version = excluded.version,
                    lease_owner = excluded.lease_owner,
                    lease_expires_at = excluded.lease_expires_at,
                    updated_at = excluded.updated_at,
                    record = excluded.record
                "#,
            )
            .bind(&record.instance_id)
            .bind(&record.function_name)
            .bind(record.parent_instance_id.as_deref())
            .bind(record.execute_after_ms as i64)
            .bind(record.is_completed as i64)
            .bind(record.version as i64)
            .bind(record.lease_owner.as_deref())
            .bind(record.lease_expires_at_ms.map(|v| v as i64))
            .bind(record.created_at_ms as i64)
            .bind(record.updated_at_ms as i64)
            .bind(&blob)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::err(operation, e))?,
        };

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_state(&self, record: InstanceRecord) -> Result<bool, StoreError> {
        let blob = serde_json::to_string(&record)
            .map_err(|e| StoreError::permanent("create_state", format!("serialize record: {e}")))?;
        let result = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, function_name, parent_instance_id,
                execute_after, is_completed, version, lease_owner, lease_expires_at,
                created_at, updated_at, record)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(instance_id) DO NOTHING
            "#,
        )
        .bind(&record.instance_id)
        .bind(&record.function_name)
        .bind(record.parent_instance_id.as_deref())
        .bind(record.execute_after_ms as i64)
        .bind(record.is_completed as i64)
        .bind(record.version as i64)
        .bind(record.lease_owner.as_deref())
        .bind(record.lease_expires_at_ms.map(|v| v as i64))
        .bind(record.created_at_ms as i64)
        .bind(record.updated_at_ms as i64)
        .bind(&blob)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("create_state", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_state(
        &self,
        record: InstanceRecord,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.write_full("save_state", &record, expected_version).await
    }

    async fn get_state(&self, instance_id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        self.load("get_state", instance_id).await
    }

    async fn get_ready_candidates(
        &self,
        now_ms: u64,
        max: usize,
    ) -> Result<Vec<ReadyCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, function_name, execute_after, version, lease_owner, lease_expires_at
            FROM instances
            WHERE is_completed = 0
              AND execute_after <= ?
              AND (lease_owner IS NULL OR lease_expires_at <= ?)
            ORDER BY execute_after, instance_id
            LIMIT ?
            "#,
        )
        .bind(now_ms as i64)
        .bind(now_ms as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::err("get_ready_candidates", e))?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let map = |e| Self::err("get_ready_candidates", e);
            candidates.push(ReadyCandidate {
                instance_id: row.try_get("instance_id").map_err(map)?,
                function_name: row.try_get("function_name").map_err(map)?,
                execute_after_ms: row.try_get::<i64, _>("execute_after").map_err(map)? as u64,
                version: row.try_get::<i64, _>("version").map_err(map)? as u64,
                lease_owner: row.try_get("lease_owner").map_err(map)?,
                lease_expires_at_ms: row
                    .try_get::<Option<i64>, _>("lease_expires_at")
                    .map_err(map)?
                    .map(|v| v as u64),
            });
        }
        Ok(candidates)
    }

    async fn try_claim_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        duration: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let now = now_ms();
        let expires = now + duration.as_millis() as u64;
        // The claimability predicate and the version bump ride in one UPDATE,
        // so a racing claimant loses on rows_affected.
        let row = sqlx::query(
            r#"
            UPDATE instances
            SET lease_owner = ?, lease_expires_at = ?, version = version + 1, updated_at = ?
            WHERE instance_id = ?
              AND is_completed = 0
              AND (lease_owner IS NULL OR lease_expires_at <= ?)
            RETURNING version
            "#,
        )
        .bind(host_id)
        .bind(expires as i64)
        .bind(now as i64)
        .bind(instance_id)
        .bind(now as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::err("try_claim_lease", e))?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| Self::err("try_claim_lease", e))?;
                debug!(target: "duratask::store::sqlite", instance_id, host_id, version, "lease claimed");
                Ok(Some(version as u64))
            }
            None => Ok(None),
        }
    }

    async fn renew_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        duration: Duration,
        expected_version: u64,
    ) -> Result<Option<u64>, StoreError> {
        let now = now_ms();
        let expires = now + duration.as_millis() as u64;
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET lease_expires_at = ?, version = version + 1, updated_at = ?
            WHERE instance_id = ? AND lease_owner = ? AND version = ?
            "#,
        )
        .bind(expires as i64)
        .bind(now as i64)
        .bind(instance_id)
        .bind(host_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("renew_lease", e))?;

        Ok(if result.rows_affected() == 1 {
            Some(expected_version + 1)
        } else {
            None
        })
    }

    async fn release_lease(
        &self,
        instance_id: &str,
        host_id: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET lease_owner = NULL, lease_expires_at = NULL, version = version + 1, updated_at = ?
            WHERE instance_id = ? AND lease_owner = ? AND version = ?
            "#,
        )
        .bind(now as i64)
        .bind(instance_id)
        .bind(host_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::err("release_lease", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_full_state(
        &self,
        instance_id: &str,
        expected_lease_owner: &str,
    ) -> Result<InstanceRecord, StoreError> {
        let now = now_ms();
        let record = self
            .load("get_full_state", instance_id)
            .await?
            .ok_or_else(|| {
                StoreError::permanent("get_full_state", format!("instance not found: {instance_id}"))
            })?;
        if record.lease_owner.as_deref() != Some(expected_lease_owner) || !record.lease_active(now) {
            return Err(StoreError::permanent(
                "get_full_state",
                format!("lease not held by {expected_lease_owner} for {instance_id}"),
            ));
        }
        Ok(record)
    }

    async fn apply_work_set(
        &self,
        instance_id: &str,
        expected_version: u64,
        work_set: WorkSet,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let mut record = match self.load("apply_work_set", instance_id).await? {
            Some(r) => r,
            None => return Ok(false),
        };
        if record.version != expected_version || record.is_completed {
            return Ok(false);
        }
        apply_work_set_to_record(&mut record, &work_set, now);
        self.write_full("apply_work_set", &record, Some(expected_version))
            .await
    }

    async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        payload: &str,
    ) -> Result<(), StoreError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let mut record = self
                .load("raise_event", instance_id)
                .await?
                .ok_or_else(|| {
                    StoreError::permanent("raise_event", format!("instance not found: {instance_id}"))
                })?;
            if record.is_completed {
                // Raising against a terminal instance is a silent no-op.
                return Ok(());
            }
            let expected = record.version;
            deliver_or_enqueue(&mut record, event_name, payload, now_ms());
            if self.write_full("raise_event", &record, Some(expected)).await? {
                return Ok(());
            }
        }
        Err(StoreError::retryable(
            "raise_event",
            format!("version contention on {instance_id}"),
        ))
    }

    async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), StoreError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let mut record = self
                .load("terminate", instance_id)
                .await?
                .ok_or_else(|| {
                    StoreError::permanent("terminate", format!("instance not found: {instance_id}"))
                })?;
            if record.is_completed {
                return Ok(());
            }
            let expected = record.version;
            mark_terminated(&mut record, reason, now_ms());
            if self.write_full("terminate", &record, Some(expected)).await? {
                return Ok(());
            }
        }
        Err(StoreError::retryable(
            "terminate",
            format!("version contention on {instance_id}"),
        ))
    }

    async fn purge(&self, instance_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::err("purge", e))?;
        Ok(result.rows_affected())
    }

    async fn count_instances(&self, filter: &InstanceFilter) -> Result<u64, StoreError> {
        Ok(self.list_instances(filter).await?.len() as u64)
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<String>, StoreError> {
        // Column prefilters narrow the scan; the status filter needs the
        // parsed record (terminated vs failed lives in the blob).
        let rows = sqlx::query(
            r#"
            SELECT * FROM instances
            WHERE (? IS NULL OR function_name = ?)
              AND (? IS NULL OR parent_instance_id = ?)
            ORDER BY instance_id
            "#,
        )
        .bind(filter.function_name.as_deref())
        .bind(filter.function_name.as_deref())
        .bind(filter.parent_instance_id.as_deref())
        .bind(filter.parent_instance_id.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::err("list_instances", e))?;

        let mut ids = Vec::new();
        for row in rows {
            let record = Self::row_to_record("list_instances", &row)?;
            if filter.matches(&record) {
                ids.push(record.instance_id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::lease_claimable;

    async fn create_test_store() -> SqliteStore {
        SqliteStore::new_in_memory()
            .await
            .expect("failed to create test store")
    }

    #[tokio::test]
    async fn record_survives_round_trip() {
        let store = create_test_store().await;
        let now = now_ms();
        let mut rec = InstanceRecord::new("i1", "Orch", "input", Some("parent".into()), now);
        rec.event_queues
            .entry("E".to_string())
            .or_default()
            .push_back("p".into());

        assert!(store.create_state(rec.clone()).await.unwrap());
        let back = store.get_state("i1").await.unwrap().unwrap();
        assert_eq!(rec, back);
    }

    #[tokio::test]
    async fn claim_bumps_version_and_blocks_strangers() {
        let store = create_test_store().await;
        let now = now_ms();
        store
            .create_state(InstanceRecord::new("i1", "F", "", None, now))
            .await
            .unwrap();

        let v = store
            .try_claim_lease("i1", "host-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v, 1);

        assert!(store
            .try_claim_lease("i1", "host-b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        let rec = store.get_state("i1").await.unwrap().unwrap();
        assert_eq!(rec.lease_owner.as_deref(), Some("host-a"));
        assert!(!lease_claimable(&rec.lease_owner, rec.lease_expires_at_ms, now_ms()));
    }

    #[tokio::test]
    async fn apply_work_set_rejects_stale_version() {
        let store = create_test_store().await;
        let now = now_ms();
        store
            .create_state(InstanceRecord::new("i1", "F", "", None, now))
            .await
            .unwrap();

        // Version moves under the committer's feet.
        store.raise_event("i1", "E", "x").await.unwrap();

        let committed = store
            .apply_work_set("i1", 0, WorkSet::completed(Ok("out".into())))
            .await
            .unwrap();
        assert!(!committed);

        let rec = store.get_state("i1").await.unwrap().unwrap();
        assert!(!rec.is_completed);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_final() {
        let store = create_test_store().await;
        let now = now_ms();
        store
            .create_state(InstanceRecord::new("i1", "F", "", None, now))
            .await
            .unwrap();

        store.terminate("i1", "user").await.unwrap();
        store.terminate("i1", "again").await.unwrap();

        let rec = store.get_state("i1").await.unwrap().unwrap();
        assert_eq!(
            rec.completed_error,
            Some(crate::FailureDetails::Terminated { reason: "user".into() })
        );

        // Raise after termination is a no-op.
        store.raise_event("i1", "E", "x").await.unwrap();
        let rec = store.get_state("i1").await.unwrap().unwrap();
        assert!(rec.event_queues.is_empty());
    }

    #[tokio::test]
    async fn purge_reports_deleted_count() {
        let store = create_test_store().await;
        store
            .create_state(InstanceRecord::new("i1", "F", "", None, now_ms()))
            .await
            .unwrap();
        assert_eq!(store.purge("i1").await.unwrap(), 1);
        assert_eq!(store.purge("i1").await.unwrap(), 0);
        assert!(store.get_state("i1").await.unwrap().is_none());
    }
}
