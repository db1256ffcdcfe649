#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use duratask::providers::in_memory::InMemoryStore;
use duratask::providers::sqlite::SqliteStore;
use duratask::{RuntimeOptions, StoreRef};

pub fn in_memory_store() -> StoreRef {
    Arc::new(InMemoryStore::default())
}

pub async fn sqlite_store() -> StoreRef {
    Arc::new(SqliteStore::new_in_memory().await.unwrap())
}

/// Options tuned for tests: tight polling, short leases.
pub fn fast_options(host_id: &str) -> RuntimeOptions {
    RuntimeOptions {
        host_id: host_id.to_string(),
        lease_duration: Duration::from_secs(5),
        lease_renewal_interval: Duration::from_secs(2),
        polling_interval: Duration::from_millis(20),
        ..RuntimeOptions::default()
    }
}

pub const WAIT: Duration = Duration::from_secs(10);
