//! Observability infrastructure: structured logging setup and engine metrics.
//!
//! Metrics export over OpenTelemetry is behind the `observability` feature
//! flag; without it an atomic-counter stub keeps the same API so the runtime
//! and tests never branch on the feature.

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};

/// Log format options for structured logging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators.
    Json,
    /// Human-readable format for development.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
}

/// Observability configuration for metrics and logging.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Enable metrics collection.
    pub metrics_enabled: bool,
    /// OTLP/gRPC endpoint for metrics export (e.g. "http://localhost:4317").
    pub metrics_export_endpoint: Option<String>,
    /// Metrics export interval in milliseconds.
    pub metrics_export_interval_ms: u64,
    /// Log output format.
    pub log_format: LogFormat,
    /// Log level filter (e.g. "info", "debug").
    pub log_level: String,
    /// Service name reported to the collector.
    pub service_name: String,
    pub service_version: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_export_endpoint: None,
            metrics_export_interval_ms: 60_000,
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            service_name: "duratask".to_string(),
            service_version: None,
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,duratask={level}")
}

/// Snapshot of the engine counters, for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub orchestrations_started: u64,
    pub orchestrations_completed: u64,
    pub orchestrations_failed: u64,
    pub function_calls: u64,
    pub function_failures: u64,
    pub events_raised: u64,
    pub events_delivered: u64,
    pub timers_created: u64,
    pub timers_fired: u64,
    pub leases_active: i64,
}

/// Test-observable totals shared by both impls.
#[derive(Default)]
struct Totals {
    orchestrations_started: AtomicU64,
    orchestrations_completed: AtomicU64,
    orchestrations_failed: AtomicU64,
    function_calls: AtomicU64,
    function_failures: AtomicU64,
    events_raised: AtomicU64,
    events_delivered: AtomicU64,
    timers_created: AtomicU64,
    timers_fired: AtomicU64,
    leases_active: AtomicI64,
}

impl Totals {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            orchestrations_started: self.orchestrations_started.load(Ordering::Relaxed),
            orchestrations_completed: self.orchestrations_completed.load(Ordering::Relaxed),
            orchestrations_failed: self.orchestrations_failed.load(Ordering::Relaxed),
            function_calls: self.function_calls.load(Ordering::Relaxed),
            function_failures: self.function_failures.load(Ordering::Relaxed),
            events_raised: self.events_raised.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            timers_created: self.timers_created.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            leases_active: self.leases_active.load(Ordering::Relaxed),
        }
    }
}

#[cfg(feature = "observability")]
mod otel_impl {
    use super::*;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider as _, UpDownCounter};
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::metrics::{ManualReader, PeriodicReader, SdkMeterProvider};
    use opentelemetry_sdk::Resource;
    use std::time::Duration;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    /// OpenTelemetry metrics provider with the engine instruments.
    pub struct MetricsProvider {
        meter_provider: SdkMeterProvider,

        orchestrations_started: Counter<u64>,
        orchestrations_completed: Counter<u64>,
        orchestrations_failed: Counter<u64>,
        function_calls: Counter<u64>,
        function_failures: Counter<u64>,
        events_raised: Counter<u64>,
        events_delivered: Counter<u64>,
        timers_created: Counter<u64>,
        timers_fired: Counter<u64>,
        leases_active: UpDownCounter<i64>,

        orchestration_duration: Histogram<u64>,
        function_duration: Histogram<u64>,
        state_save_duration: Histogram<u64>,
        state_load_duration: Histogram<u64>,

        totals: Totals,
    }

    impl MetricsProvider {
        pub fn new(config: &ObservabilityConfig) -> Result<Self, String> {
            let resource = Resource::new(vec![
                KeyValue::new("service.name", config.service_name.clone()),
                KeyValue::new(
                    "service.version",
                    config
                        .service_version
                        .clone()
                        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
                ),
            ]);

            let meter_provider = if let Some(ref endpoint) = config.metrics_export_endpoint {
                let exporter = opentelemetry_otlp::MetricExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()
                    .map_err(|e| format!("failed to create metrics exporter: {e}"))?;
                let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
                    .with_interval(Duration::from_millis(config.metrics_export_interval_ms))
                    .build();
                SdkMeterProvider::builder()
                    .with_reader(reader)
                    .with_resource(resource)
                    .build()
            } else {
                let reader = ManualReader::builder().build();
                SdkMeterProvider::builder()
                    .with_reader(reader)
                    .with_resource(resource)
                    .build()
            };

            let meter = meter_provider.meter("duratask");

            let orchestrations_started = meter
                .u64_counter("duratask.orchestrations.started")
                .with_description("Orchestration instances that began execution")
                .build();
            let orchestrations_completed = meter
                .u64_counter("duratask.orchestrations.completed")
                .with_description("Orchestration instances completed successfully")
                .build();
            let orchestrations_failed = meter
                .u64_counter("duratask.orchestrations.failed")
                .with_description("Orchestration instances failed or terminated")
                .build();
            let function_calls = meter
                .u64_counter("duratask.functions.calls")
                .with_description("Activity and sub-orchestrator invocations scheduled")
                .build();
            let function_failures = meter
                .u64_counter("duratask.functions.failures")
                .with_description("Activity executions that returned an error")
                .build();
            let events_raised = meter
                .u64_counter("duratask.events.raised")
                .with_description("External events raised")
                .build();
            let events_delivered = meter
                .u64_counter("duratask.events.delivered")
                .with_description("External events consumed by a wait slot")
                .build();
            let timers_created = meter
                .u64_counter("duratask.timers.created")
                .with_description("Durable timers armed")
                .build();
            let timers_fired = meter
                .u64_counter("duratask.timers.fired")
                .with_description("Durable timers fired")
                .build();
            let leases_active = meter
                .i64_up_down_counter("duratask.leases.active")
                .with_description("Leases currently held by this host")
                .build();
            let orchestration_duration = meter
                .u64_histogram("duratask.orchestration.duration_ms")
                .with_description("Creation-to-completion time of orchestration instances")
                .build();
            let function_duration = meter
                .u64_histogram("duratask.function.duration_ms")
                .with_description("Activity execution duration")
                .build();
            let state_save_duration = meter
                .u64_histogram("duratask.state.save_ms")
                .with_description("State save latency")
                .build();
            let state_load_duration = meter
                .u64_histogram("duratask.state.load_ms")
                .with_description("State load latency")
                .build();

            Ok(Self {
                meter_provider,
                orchestrations_started,
                orchestrations_completed,
                orchestrations_failed,
                function_calls,
                function_failures,
                events_raised,
                events_delivered,
                timers_created,
                timers_fired,
                leases_active,
                orchestration_duration,
                function_duration,
                state_save_duration,
                state_load_duration,
                totals: Totals::default(),
            })
        }

        pub fn meter_provider(&self) -> &SdkMeterProvider {
            &self.meter_provider
        }

        pub async fn shutdown(self) -> Result<(), String> {
            self.meter_provider
                .shutdown()
                .map_err(|e| format!("failed to shutdown metrics provider: {e}"))
        }

        #[inline]
        pub fn record_orchestration_started(&self) {
            self.orchestrations_started.add(1, &[]);
            self.totals.orchestrations_started.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_orchestration_completed(&self, duration_ms: u64) {
            self.orchestrations_completed.add(1, &[]);
            self.orchestration_duration.record(duration_ms, &[]);
            self.totals.orchestrations_completed.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_orchestration_failed(&self, category: &'static str) {
            self.orchestrations_failed.add(1, &[KeyValue::new("category", category)]);
            self.totals.orchestrations_failed.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_function_call(&self) {
            self.function_calls.add(1, &[]);
            self.totals.function_calls.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_function_failure(&self) {
            self.function_failures.add(1, &[]);
            self.totals.function_failures.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_function_duration_ms(&self, duration_ms: u64) {
            self.function_duration.record(duration_ms, &[]);
        }

        #[inline]
        pub fn record_event_raised(&self) {
            self.events_raised.add(1, &[]);
            self.totals.events_raised.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_event_delivered(&self) {
            self.events_delivered.add(1, &[]);
            self.totals.events_delivered.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_timer_created(&self) {
            self.timers_created.add(1, &[]);
            self.totals.timers_created.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_timer_fired(&self) {
            self.timers_fired.add(1, &[]);
            self.totals.timers_fired.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_lease_acquired(&self) {
            self.leases_active.add(1, &[]);
            self.totals.leases_active.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_lease_released(&self) {
            self.leases_active.add(-1, &[]);
            self.totals.leases_active.fetch_sub(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_state_save_ms(&self, duration_ms: u64) {
            self.state_save_duration.record(duration_ms, &[]);
        }

        #[inline]
        pub fn record_state_load_ms(&self, duration_ms: u64) {
            self.state_load_duration.record(duration_ms, &[]);
        }

        pub fn snapshot(&self) -> MetricsSnapshot {
            self.totals.snapshot()
        }
    }

    pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

        match config.log_format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| format!("failed to initialize JSON logging: {e}")),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|e| format!("failed to initialize pretty logging: {e}")),
            LogFormat::Compact => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()
                .map_err(|e| format!("failed to initialize compact logging: {e}")),
        }
    }
}

#[cfg(not(feature = "observability"))]
mod stub_impl {
    use super::*;

    /// Counter-only metrics provider used when the `observability` feature is
    /// disabled.
    #[derive(Default)]
    pub struct MetricsProvider {
        totals: Totals,
    }

    impl MetricsProvider {
        pub fn new(_config: &ObservabilityConfig) -> Result<Self, String> {
            Ok(Self::default())
        }

        pub async fn shutdown(self) -> Result<(), String> {
            Ok(())
        }

        #[inline]
        pub fn record_orchestration_started(&self) {
            self.totals.orchestrations_started.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_orchestration_completed(&self, _duration_ms: u64) {
            self.totals.orchestrations_completed.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_orchestration_failed(&self, _category: &'static str) {
            self.totals.orchestrations_failed.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_function_call(&self) {
            self.totals.function_calls.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_function_failure(&self) {
            self.totals.function_failures.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_function_duration_ms(&self, _duration_ms: u64) {}

        #[inline]
        pub fn record_event_raised(&self) {
            self.totals.events_raised.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_event_delivered(&self) {
            self.totals.events_delivered.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_timer_created(&self) {
            self.totals.timers_created.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_timer_fired(&self) {
            self.totals.timers_fired.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_lease_acquired(&self) {
            self.totals.leases_active.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_lease_released(&self) {
            self.totals.leases_active.fetch_sub(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn record_state_save_ms(&self, _duration_ms: u64) {}

        #[inline]
        pub fn record_state_load_ms(&self, _duration_ms: u64) {}

        pub fn snapshot(&self) -> MetricsSnapshot {
            self.totals.snapshot()
        }
    }

    pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(default_filter_expression(&config.log_level))
        });

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init()
            .map_err(|e| format!("failed to initialize logging: {e}"))
    }
}

#[cfg(feature = "observability")]
pub use otel_impl::*;

#[cfg(not(feature = "observability"))]
pub use stub_impl::*;

/// Handle that owns the metrics/logging lifecycle. All record methods are
/// no-ops when metrics are disabled.
pub struct ObservabilityHandle {
    metrics_provider: Option<Arc<MetricsProvider>>,
}

impl ObservabilityHandle {
    pub fn init(config: &ObservabilityConfig) -> Result<Self, String> {
        // Logging failure is tolerated: a global subscriber may already be set.
        if let Err(err) = init_logging(config) {
            tracing::debug!(target: "duratask::runtime", "logging init skipped: {err}");
        }

        let metrics_provider = if config.metrics_enabled {
            Some(Arc::new(MetricsProvider::new(config)?))
        } else {
            None
        };

        Ok(Self { metrics_provider })
    }

    /// A handle with metrics disabled and no logging side effects.
    pub fn disabled() -> Self {
        Self {
            metrics_provider: None,
        }
    }

    /// A handle with in-process counters enabled (no export); used by tests.
    pub fn with_counters() -> Self {
        Self {
            metrics_provider: MetricsProvider::new(&ObservabilityConfig::default())
                .ok()
                .map(Arc::new),
        }
    }

    pub fn metrics_provider(&self) -> Option<&Arc<MetricsProvider>> {
        self.metrics_provider.as_ref()
    }

    pub fn metrics_snapshot(&self) -> Option<MetricsSnapshot> {
        self.metrics_provider.as_ref().map(|p| p.snapshot())
    }

    #[inline]
    pub fn record_orchestration_started(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_orchestration_started();
        }
    }

    #[inline]
    pub fn record_orchestration_completed(&self, duration_ms: u64) {
        if let Some(p) = &self.metrics_provider {
            p.record_orchestration_completed(duration_ms);
        }
    }

    #[inline]
    pub fn record_orchestration_failed(&self, category: &'static str) {
        if let Some(p) = &self.metrics_provider {
            p.record_orchestration_failed(category);
        }
    }

    #[inline]
    pub fn record_function_call(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_function_call();
        }
    }

    #[inline]
    pub fn record_function_failure(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_function_failure();
        }
    }

    #[inline]
    pub fn record_function_duration_ms(&self, duration_ms: u64) {
        if let Some(p) = &self.metrics_provider {
            p.record_function_duration_ms(duration_ms);
        }
    }

    #[inline]
    pub fn record_event_raised(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_event_raised();
        }
    }

    #[inline]
    pub fn record_event_delivered(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_event_delivered();
        }
    }

    #[inline]
    pub fn record_timer_created(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_timer_created();
        }
    }

    #[inline]
    pub fn record_timer_fired(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_timer_fired();
        }
    }

    #[inline]
    pub fn record_lease_acquired(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_lease_acquired();
        }
    }

    #[inline]
    pub fn record_lease_released(&self) {
        if let Some(p) = &self.metrics_provider {
            p.record_lease_released();
        }
    }

    #[inline]
    pub fn record_state_save_ms(&self, duration_ms: u64) {
        if let Some(p) = &self.metrics_provider {
            p.record_state_save_ms(duration_ms);
        }
    }

    #[inline]
    pub fn record_state_load_ms(&self, duration_ms: u64) {
        if let Some(p) = &self.metrics_provider {
            p.record_state_load_ms(duration_ms);
        }
    }
}
