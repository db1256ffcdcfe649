//! Background lease renewal for in-flight executions.
//!
//! A claim is good for `lease_duration`; anything that may outlive half of
//! that (long activities, slow stores) needs the lease refreshed on a cadence.
//! Renewal is itself a CAS, so every renewal moves the record version; the
//! renewer tracks the moving version and the committer reads it back after
//! stopping the loop, which keeps renewal and commit strictly ordered.
//!
//! A failed renewal means the lease is gone (another host stole it, or an
//! external CAS moved the version). The renewer flags the loss and fires the
//! cancellation token handed to the running activity; the work set is
//! discarded at commit time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::StoreRef;

struct RenewalState {
    version: AtomicU64,
    lost: AtomicBool,
}

pub(crate) struct LeaseRenewer {
    handle: JoinHandle<()>,
    state: Arc<RenewalState>,
    stop: CancellationToken,
}

impl LeaseRenewer {
    pub(crate) fn start(
        store: StoreRef,
        instance_id: String,
        host_id: String,
        lease_duration: Duration,
        renewal_interval: Duration,
        initial_version: u64,
        on_lost: CancellationToken,
    ) -> Self {
        let state = Arc::new(RenewalState {
            version: AtomicU64::new(initial_version),
            lost: AtomicBool::new(false),
        });
        let stop = CancellationToken::new();

        let task_state = state.clone();
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = tokio::time::sleep(renewal_interval) => {}
                }
                let expected = task_state.version.load(Ordering::Acquire);
                match store
                    .renew_lease(&instance_id, &host_id, lease_duration, expected)
                    .await
                {
                    Ok(Some(version)) => {
                        task_state.version.store(version, Ordering::Release);
                        debug!(target: "duratask::lease", instance_id = %instance_id, version, "lease renewed");
                    }
                    Ok(None) => {
                        warn!(target: "duratask::lease", instance_id = %instance_id, host_id = %host_id, "lease lost during execution");
                        task_state.lost.store(true, Ordering::Release);
                        on_lost.cancel();
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        // Transient store trouble; lease expiry is the backstop.
                        debug!(target: "duratask::lease", instance_id = %instance_id, error = %e, "lease renewal error, will retry");
                    }
                    Err(e) => {
                        warn!(target: "duratask::lease", instance_id = %instance_id, error = %e, "lease renewal failed permanently");
                        task_state.lost.store(true, Ordering::Release);
                        on_lost.cancel();
                        break;
                    }
                }
            }
        });

        Self { handle, state, stop }
    }

    /// Stop renewing and report `(current_version, lost)`. Awaiting the task
    /// before reading the version guarantees no renewal lands after the
    /// caller's commit CAS is prepared.
    pub(crate) async fn stop(self) -> (u64, bool) {
        self.stop.cancel();
        let _ = self.handle.await;
        (
            self.state.version.load(Ordering::Acquire),
            self.state.lost.load(Ordering::Acquire),
        )
    }
}
