// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic delivery of instrumentation telemetry.
//!
//! Each tick assembles the due events (lifecycle, metrics, logs, periodic
//! sections, heartbeat), wraps them in the versioned envelope, and POSTs one
//! request per event. Producer methods never surface errors into application
//! code; everything risky happens on the scheduler task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ReportingError;
use crate::scheduler::{PeriodicService, PeriodicTask};
use crate::state::{unix_timestamp_secs, ProcessGeneration, ReporterState};
use crate::telemetry::events::{
    Application, EventQueues, Host, IntegrationRecord, LogLevel, LogRecord, PayloadType,
    TelemetryEvent,
};
use crate::telemetry::metrics::{MetricKind, MetricStore};
use crate::transport::{build_headers, RetryPolicy, RetryingTransport, SendOutcome, TransportRequest};

/// Bound on the best-effort flush performed on abnormal termination.
const ABNORMAL_TERMINATION_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Products whose activation is reported to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Product {
    Apm,
    AppSec,
    DynamicInstrumentation,
    Profiling,
}

impl Product {
    fn as_str(self) -> &'static str {
        match self {
            Product::Apm => "apm",
            Product::AppSec => "appsec",
            Product::DynamicInstrumentation => "dynamic_instrumentation",
            Product::Profiling => "profiler",
        }
    }
}

#[derive(Default)]
struct ProductState {
    products: HashMap<Product, bool>,
    changed: bool,
}

impl ProductState {
    fn to_payload(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (product, enabled) in &self.products {
            map.insert(product.as_str().to_string(), json!({ "enabled": enabled }));
        }
        serde_json::Value::Object(map)
    }
}

pub struct TelemetryReporter {
    endpoint: String,
    headers: HeaderMap,
    application: Application,
    host: Host,
    debug: bool,
    dependency_collection: bool,
    interval: Duration,
    /// Ticks to skip between flushes of the periodic sections.
    periodic_threshold: u32,
    periodic_count: AtomicU32,
    queues: EventQueues,
    metrics: Mutex<MetricStore>,
    products: Mutex<ProductState>,
    pending_error: Mutex<Option<(u32, String)>>,
    transport: RetryingTransport,
    service: PeriodicService,
    state: Arc<ReporterState>,
    generation: ProcessGeneration,
    enabled: AtomicBool,
}

impl TelemetryReporter {
    pub fn new(config: &Config, state: Arc<ReporterState>) -> Result<Self, ReportingError> {
        config.validate()?;
        let policy =
            RetryPolicy::for_interval(config.telemetry_flush_interval, config.retry_attempts);
        let transport = RetryingTransport::new(config.request_timeout, policy)?;

        let mut header_pairs = vec![
            ("Content-Type", "application/json".to_string()),
            ("DD-Client-Library-Language", config.language.clone()),
            ("DD-Client-Library-Version", config.tracer_version.clone()),
            ("DD-Telemetry-Debug-Enabled", config.debug.to_string()),
            ("DD-Telemetry-API-Version", "v2".to_string()),
        ];
        if config.agentless {
            if let Some(api_key) = &config.api_key {
                header_pairs.push(("DD-API-KEY", api_key.clone()));
            }
        }

        let interval_secs = config.telemetry_flush_interval.as_secs_f64();
        let heartbeat_secs = config.heartbeat_interval.as_secs_f64();
        let periodic_threshold = if interval_secs > 0.0 {
            ((heartbeat_secs / interval_secs).round() as u32).saturating_sub(1)
        } else {
            0
        };

        Ok(TelemetryReporter {
            endpoint: config.telemetry_endpoint(),
            headers: build_headers(&header_pairs),
            application: Application {
                service_name: config.service.clone(),
                env: config.env.clone(),
                service_version: config.version.clone(),
                language_name: config.language.clone(),
                language_version: config.language_version.clone(),
                tracer_version: config.tracer_version.clone(),
            },
            host: Host {
                hostname: config.hostname.clone(),
            },
            debug: config.debug,
            dependency_collection: config.dependency_collection,
            interval: config.telemetry_flush_interval,
            periodic_threshold,
            periodic_count: AtomicU32::new(0),
            queues: EventQueues::new(),
            metrics: Mutex::new(MetricStore::new()),
            products: Mutex::new(ProductState::default()),
            pending_error: Mutex::new(None),
            transport,
            service: PeriodicService::new(config.telemetry_flush_interval),
            state,
            generation: ProcessGeneration::new(),
            enabled: AtomicBool::new(config.telemetry_enabled),
        })
    }

    pub fn start(self: Arc<Self>) {
        if !self.enabled() {
            return;
        }
        let task: Arc<dyn PeriodicTask> = self.clone();
        self.service.start(task);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    // ---- producer API, all lock-only ----

    pub fn add_count_metric(&self, namespace: &str, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.add_metric(MetricKind::Count, namespace, name, value, tags);
    }

    pub fn add_rate_metric(&self, namespace: &str, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.add_metric(MetricKind::Rate, namespace, name, value, tags);
    }

    pub fn add_gauge_metric(&self, namespace: &str, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.add_metric(MetricKind::Gauge, namespace, name, value, tags);
    }

    pub fn add_distribution_metric(
        &self,
        namespace: &str,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) {
        self.add_metric(MetricKind::Distribution, namespace, name, value, tags);
    }

    fn add_metric(
        &self,
        kind: MetricKind,
        namespace: &str,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) {
        if !self.enabled() {
            return;
        }
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(kind, namespace, name, value, tags, self.interval);
    }

    pub fn add_log(
        &self,
        level: LogLevel,
        message: &str,
        stack_trace: Option<&str>,
        tags: &[(&str, &str)],
    ) {
        if !self.enabled() {
            return;
        }
        let tags = tags
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(",");
        self.queues.add_log(LogRecord {
            message: message.to_string(),
            level,
            tags,
            stack_trace: stack_trace.map(str::to_string),
            tracer_time: unix_timestamp_secs(),
        });
    }

    pub fn add_integration(&self, record: IntegrationRecord) {
        if !self.enabled() {
            return;
        }
        self.queues.add_integration(record);
    }

    pub fn add_configuration(&self, name: &str, origin: &str, value: serde_json::Value) {
        if !self.enabled() {
            return;
        }
        self.queues.add_configuration(name, origin, value);
    }

    pub fn add_configurations(&self, entries: Vec<(String, String, serde_json::Value)>) {
        for (name, origin, value) in entries {
            self.add_configuration(&name, &origin, value);
        }
    }

    pub fn add_dependency(&self, name: &str, version: Option<&str>) {
        if !self.enabled() || !self.dependency_collection {
            return;
        }
        self.queues.add_dependency(name, version);
    }

    /// Records a startup error reported with the `app-started` event.
    pub fn add_error(&self, code: u32, message: &str) {
        let mut pending = self.pending_error.lock().unwrap_or_else(|e| e.into_inner());
        *pending = Some((code, message.to_string()));
    }

    pub fn product_activated(&self, product: Product, enabled: bool) {
        let mut products = self.products.lock().unwrap_or_else(|e| e.into_inner());
        let previous = products.products.insert(product, enabled);
        if self.state.started() && previous != Some(enabled) {
            products.changed = true;
        }
    }

    // ---- lifecycle ----

    /// Drops queued data and stops the loop; permanent for the process.
    pub async fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.queues.reset();
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.service.stop().await;
    }

    /// Resets inherited state in a forked child: queues, metrics, the
    /// sequence counter and the periodic tick count all restart. Lifecycle
    /// events (`app-started`, `app-closing`) stay suppressed from here on.
    pub fn handle_fork(&self) {
        self.queues.reset();
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.state.restart_sequence();
        self.state.mark_forked();
        self.generation.mark_current();
        self.periodic_count.store(0, Ordering::Relaxed);
        debug!("telemetry reset after fork");
    }

    /// Final drain (sends `app-closing`) bounded by `timeout`, then stop.
    pub async fn shutdown(self: Arc<Self>, timeout: Duration) -> Result<(), ReportingError> {
        let task: Arc<dyn PeriodicTask> = self.clone();
        self.service.shutdown(task, timeout).await
    }

    /// [`shutdown`](Self::shutdown) with the default bound.
    pub async fn app_shutdown(self: Arc<Self>) -> Result<(), ReportingError> {
        self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Best-effort bounded flush for abnormal termination paths (panic
    /// hooks, signal handlers). Never blocks process exit past the bound.
    pub async fn handle_abnormal_termination(&self) {
        if !self.enabled() {
            return;
        }
        let _ = tokio::time::timeout(ABNORMAL_TERMINATION_FLUSH_TIMEOUT, self.flush(true)).await;
    }

    // ---- tick internals ----

    /// Pushes every event due this tick onto the shared queue, then drains
    /// and delivers the whole queue one request per event.
    async fn flush(&self, shutting_down: bool) -> Result<(), ReportingError> {
        let now = unix_timestamp_secs();

        self.queue_app_started();
        self.queue_product_change();
        self.queue_metrics(now);
        self.queue_logs();
        self.queue_periodic_sections(shutting_down);
        if shutting_down && !self.state.forked() {
            self.enqueue(PayloadType::AppClosing, json!({}));
        }
        self.enqueue(PayloadType::AppHeartbeat, json!({}));

        for event in self.queues.flush_events() {
            self.send_event(event).await;
        }
        Ok(())
    }

    /// Wraps one payload in the versioned envelope, stamping the sequence id
    /// at enqueue time so ids follow queue order, and appends it.
    fn enqueue(&self, payload_type: PayloadType, payload: serde_json::Value) {
        self.queues.push_event(TelemetryEvent {
            tracer_time: unix_timestamp_secs(),
            runtime_id: self.state.runtime_id().to_string(),
            api_version: "v2",
            seq_id: self.state.next_seq_id(),
            debug: self.debug,
            application: self.application.clone(),
            host: self.host.clone(),
            payload,
            request_type: payload_type,
        });
    }

    fn queue_app_started(&self) {
        if self.state.started() {
            return;
        }
        if self.state.forked() {
            // Children never re-announce the application.
            self.state.mark_started();
            return;
        }
        if !self.state.mark_started() {
            return;
        }

        let configuration = self.queues.flush_configurations();
        let products = self
            .products
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .to_payload();
        let error = self
            .pending_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let mut payload = json!({
            "configuration": configuration,
            "products": products,
        });
        if let Some((code, message)) = error {
            payload["error"] = json!({ "code": code, "message": message });
        }
        self.enqueue(PayloadType::AppStarted, payload);
    }

    fn queue_product_change(&self) {
        let mut products = self.products.lock().unwrap_or_else(|e| e.into_inner());
        if !products.changed {
            return;
        }
        products.changed = false;
        let payload = json!({ "products": products.to_payload() });
        drop(products);
        self.enqueue(PayloadType::AppProductChange, payload);
    }

    fn queue_metrics(&self, now: u64) {
        let flush = self
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flush(now);
        if flush.is_empty() {
            return;
        }
        for (namespace, series) in flush.metrics {
            self.enqueue(
                PayloadType::GenerateMetrics,
                json!({ "namespace": namespace, "series": series }),
            );
        }
        for (namespace, series) in flush.distributions {
            self.enqueue(
                PayloadType::Distributions,
                json!({ "namespace": namespace, "series": series }),
            );
        }
    }

    fn queue_logs(&self) {
        let logs = self.queues.flush_logs();
        if logs.is_empty() {
            return;
        }
        self.enqueue(PayloadType::Logs, json!({ "logs": logs }));
    }

    /// Integrations, configuration changes and dependencies go out every
    /// Nth tick; the shutdown drain forces them out regardless.
    fn queue_periodic_sections(&self, shutting_down: bool) {
        if !shutting_down {
            let count = self.periodic_count.load(Ordering::Relaxed);
            if count < self.periodic_threshold {
                self.periodic_count.store(count + 1, Ordering::Relaxed);
                return;
            }
            self.periodic_count.store(0, Ordering::Relaxed);
        }

        let integrations = self.queues.flush_integrations();
        if !integrations.is_empty() {
            self.enqueue(
                PayloadType::AppIntegrationsChange,
                json!({ "integrations": integrations }),
            );
        }

        let configurations = self.queues.flush_configurations();
        if !configurations.is_empty() {
            self.enqueue(
                PayloadType::AppClientConfigurationChange,
                json!({ "configuration": configurations }),
            );
        }

        if self.dependency_collection {
            let dependencies = self.queues.flush_dependencies();
            if !dependencies.is_empty() {
                self.enqueue(
                    PayloadType::AppDependenciesLoaded,
                    json!({ "dependencies": dependencies }),
                );
            }
        }
    }

    /// Delivers one enveloped event. An encoding failure drops this payload
    /// only; a delivery failure is logged and the payload is dropped
    /// (at-most-once).
    async fn send_event(&self, event: TelemetryEvent) {
        let payload_type = event.request_type;
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    request_type = payload_type.as_str(),
                    "dropping unencodable telemetry event: {}", e
                );
                return;
            }
        };

        let mut headers = self.headers.clone();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(payload_type.as_str()) {
            headers.insert("DD-Telemetry-Request-Type", value);
        }
        let request = TransportRequest {
            method: Method::POST,
            url: self.endpoint.clone(),
            headers,
            body,
        };

        match self.transport.send(&request).await {
            SendOutcome::Delivered(status) => {
                debug!(
                    request_type = payload_type.as_str(),
                    status, "telemetry event delivered"
                );
            }
            SendOutcome::TransientFailure(reason) => {
                warn!(
                    request_type = payload_type.as_str(),
                    "telemetry event dropped after retries: {}", reason
                );
            }
            SendOutcome::PermanentFailure { status, reason } => {
                warn!(
                    request_type = payload_type.as_str(),
                    status = ?status,
                    "telemetry event rejected: {}", reason
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl PeriodicTask for TelemetryReporter {
    async fn tick(&self, shutting_down: bool) -> Result<(), ReportingError> {
        if !self.enabled() {
            return Ok(());
        }
        if self.generation.changed() {
            self.handle_fork();
            return Ok(());
        }
        self.flush(shutting_down).await
    }

    fn name(&self) -> &'static str {
        "telemetry-reporter"
    }
}
