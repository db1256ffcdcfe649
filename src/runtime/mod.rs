//! The worker-host runtime: registries, configuration, and the scheduler
//! lifecycle.
//!
//! A process builds its registries, constructs a store, and calls
//! [`Runtime::start_with_store`]. Any number of hosts may share one store;
//! leases keep them from replaying the same instance concurrently and the
//! version CAS keeps them correct even when they try.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{now_ms, ActivityContext, Client, OrchestrationContext, StoreRef};

mod lease;
pub mod observability;
pub mod registry;
pub mod replay;
mod scheduler;

pub use observability::{LogFormat, MetricsSnapshot, ObservabilityConfig, ObservabilityHandle};
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder,
};

/// Trait implemented by orchestration handlers the runtime can invoke.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements [`OrchestrationHandler`].
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers the runtime can invoke.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Stable identifier for this process; appears in lease ownership.
    /// Must be unique per host.
    pub host_id: String,

    /// How long a claim lasts before another host may steal it.
    /// Must be greater than `polling_interval`.
    pub lease_duration: Duration,

    /// Cadence at which an executing host refreshes its lease.
    /// Must be less than `lease_duration`.
    pub lease_renewal_interval: Duration,

    /// Cadence of the scheduler's candidate scan.
    pub polling_interval: Duration,

    /// Bound on simultaneous executions per host.
    pub max_concurrent_instances: usize,

    /// Client-side bound on start/raise payload sizes, in bytes.
    pub max_input_size: usize,

    /// Maximum candidates fetched per polling cycle.
    pub poll_batch_size: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            host_id: generate_host_id(),
            lease_duration: Duration::from_secs(300),
            lease_renewal_interval: Duration::from_secs(150),
            polling_interval: Duration::from_millis(100),
            max_concurrent_instances: 64,
            max_input_size: 1024 * 1024,
            poll_batch_size: 16,
        }
    }
}

impl RuntimeOptions {
    fn validate(&self) -> Result<(), String> {
        if self.host_id.is_empty() {
            return Err("host_id must not be empty".into());
        }
        if self.lease_duration <= self.polling_interval {
            return Err("lease_duration must be greater than polling_interval".into());
        }
        if self.lease_renewal_interval >= self.lease_duration {
            return Err("lease_renewal_interval must be less than lease_duration".into());
        }
        if self.polling_interval.is_zero() {
            return Err("polling_interval must be non-zero".into());
        }
        if self.max_concurrent_instances == 0 {
            return Err("max_concurrent_instances must be non-zero".into());
        }
        Ok(())
    }
}

fn generate_host_id() -> String {
    format!("host-{}-{:x}", std::process::id(), now_ms())
}

/// A running worker host: one polling scheduler plus a bounded pool of
/// concurrent instance executions, all against the shared store.
pub struct Runtime {
    store: StoreRef,
    options: Arc<RuntimeOptions>,
    observability: Arc<ObservabilityHandle>,
    cancel: CancellationToken,
    scheduler_join: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a host backed by an in-memory SQLite database. Convenient for
    /// examples and single-process setups.
    pub async fn start(
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        let store: StoreRef = Arc::new(
            crate::providers::sqlite::SqliteStore::new_in_memory()
                .await
                .expect("in-memory sqlite store"),
        );
        Self::start_with_store(store, activities, orchestrations).await
    }

    /// Start a host with a custom store and default options.
    pub async fn start_with_store(
        store: StoreRef,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Start a host with explicit options.
    ///
    /// # Panics
    /// Panics on invalid option combinations or when a name is registered as
    /// both an orchestration and an activity; both are deployment errors.
    pub async fn start_with_options(
        store: StoreRef,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let observability = Arc::new(ObservabilityHandle::with_counters());
        Self::start_inner(store, activities, orchestrations, options, observability)
    }

    /// Start a host with explicit options and observability configuration
    /// (structured logging plus optional OTLP metrics export).
    pub async fn start_with_observability(
        store: StoreRef,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
        config: &ObservabilityConfig,
    ) -> Result<Arc<Self>, String> {
        let observability = Arc::new(ObservabilityHandle::init(config)?);
        Ok(Self::start_inner(
            store,
            activities,
            orchestrations,
            options,
            observability,
        ))
    }

    fn start_inner(
        store: StoreRef,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
        observability: Arc<ObservabilityHandle>,
    ) -> Arc<Self> {
        if let Err(message) = options.validate() {
            panic!("invalid runtime options: {message}");
        }
        for name in orchestrations.list_names() {
            assert!(
                !activities.has(&name),
                "'{name}' is registered as both an orchestration and an activity"
            );
        }

        let options = Arc::new(options);
        let cancel = CancellationToken::new();

        let scheduler = Arc::new(scheduler::Scheduler::new(
            store.clone(),
            activities,
            orchestrations,
            options.clone(),
            observability.clone(),
            cancel.clone(),
        ));
        let scheduler_join = tokio::spawn(scheduler.run());

        tracing::info!(
            target: "duratask::runtime",
            host_id = %options.host_id,
            store = store.name(),
            "runtime started"
        );

        Arc::new(Self {
            store,
            options,
            observability,
            cancel,
            scheduler_join: Mutex::new(Some(scheduler_join)),
        })
    }

    /// A client bound to this runtime's store, with the host's input-size
    /// limit applied.
    pub fn client(&self) -> Client {
        Client::new(self.store.clone()).with_max_input_size(self.options.max_input_size)
    }

    pub fn store(&self) -> StoreRef {
        self.store.clone()
    }

    pub fn host_id(&self) -> &str {
        &self.options.host_id
    }

    pub fn observability(&self) -> &Arc<ObservabilityHandle> {
        &self.observability
    }

    pub fn metrics_snapshot(&self) -> Option<MetricsSnapshot> {
        self.observability.metrics_snapshot()
    }

    /// Graceful shutdown: stop issuing new claims, drain in-flight
    /// executions, release their leases, and return.
    pub async fn shutdown(self: Arc<Self>) {
        self.cancel.cancel();
        let join = self.scheduler_join.lock().await.take();
        if let Some(join) = join {
            let _ = join.await;
        }
        tracing::info!(
            target: "duratask::runtime",
            host_id = %self.options.host_id,
            "runtime stopped"
        );
    }
}
