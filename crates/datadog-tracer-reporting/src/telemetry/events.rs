// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry event types and producer-facing queues.
//!
//! All queues live behind one mutex: producers only ever lock and mutate
//! in-memory collections, never serialize and never touch the network. The
//! reporter drains immutable snapshots at flush time.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use serde::Serialize;

/// Discrete telemetry request types, in their wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadType {
    AppStarted,
    AppClosing,
    AppHeartbeat,
    AppIntegrationsChange,
    AppClientConfigurationChange,
    AppDependenciesLoaded,
    AppProductChange,
    GenerateMetrics,
    Distributions,
    Logs,
}

impl PayloadType {
    /// Wire name, also used for the `DD-Telemetry-Request-Type` header.
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadType::AppStarted => "app-started",
            PayloadType::AppClosing => "app-closing",
            PayloadType::AppHeartbeat => "app-heartbeat",
            PayloadType::AppIntegrationsChange => "app-integrations-change",
            PayloadType::AppClientConfigurationChange => "app-client-configuration-change",
            PayloadType::AppDependenciesLoaded => "app-dependencies-loaded",
            PayloadType::AppProductChange => "app-product-change",
            PayloadType::GenerateMetrics => "generate-metrics",
            PayloadType::Distributions => "distributions",
            PayloadType::Logs => "logs",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Application {
    pub service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    pub language_name: String,
    pub language_version: String,
    pub tracer_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub hostname: String,
}

/// The versioned request body posted for every telemetry event.
#[derive(Debug, Serialize)]
pub struct TelemetryEvent {
    pub tracer_time: u64,
    pub runtime_id: String,
    pub api_version: &'static str,
    pub seq_id: u64,
    pub debug: bool,
    pub application: Application,
    pub host: Host,
    pub payload: serde_json::Value,
    pub request_type: PayloadType,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrationRecord {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub auto_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationRecord {
    pub name: String,
    pub origin: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Debug,
}

/// A telemetry log line. Identity excludes the timestamp so repeated
/// occurrences of the same line collapse into the first-seen record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub message: String,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub tracer_time: u64,
}

impl PartialEq for LogRecord {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
            && self.level == other.level
            && self.tags == other.tags
            && self.stack_trace == other.stack_trace
    }
}

impl Eq for LogRecord {}

impl Hash for LogRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.message.hash(state);
        self.level.hash(state);
        self.tags.hash(state);
        self.stack_trace.hash(state);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Default)]
struct QueueState {
    events: Vec<TelemetryEvent>,
    integrations: HashMap<String, IntegrationRecord>,
    configurations: HashMap<String, ConfigurationRecord>,
    logs: HashSet<LogRecord>,
    dependencies: Vec<DependencyRecord>,
    /// All-time dedup across flushes; a dependency is reported once per process.
    seen_dependencies: HashSet<String>,
}

/// Producer-facing queues shared between the host application and the
/// telemetry reporter.
pub struct EventQueues {
    state: Mutex<QueueState>,
}

impl EventQueues {
    pub fn new() -> Self {
        EventQueues {
            state: Mutex::new(QueueState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a fully-enveloped event; the caller stamps the sequence id at
    /// enqueue time so ids follow queue order.
    pub fn push_event(&self, event: TelemetryEvent) {
        self.lock().events.push(event);
    }

    /// Last write wins per integration name.
    pub fn add_integration(&self, record: IntegrationRecord) {
        self.lock().integrations.insert(record.name.clone(), record);
    }

    /// Last write wins per setting name. Non-scalar values are flattened to
    /// their JSON text so the backend always receives a primitive.
    pub fn add_configuration(&self, name: &str, origin: &str, value: serde_json::Value) {
        let value = normalize_config_value(value);
        self.lock().configurations.insert(
            name.to_string(),
            ConfigurationRecord {
                name: name.to_string(),
                origin: origin.to_string(),
                value,
            },
        );
    }

    pub fn add_log(&self, record: LogRecord) {
        // HashSet keeps the first-seen record, so the earliest timestamp wins.
        self.lock().logs.insert(record);
    }

    pub fn add_dependency(&self, name: &str, version: Option<&str>) {
        let mut state = self.lock();
        if !state.seen_dependencies.insert(name.to_string()) {
            return;
        }
        state.dependencies.push(DependencyRecord {
            name: name.to_string(),
            version: version.map(str::to_string),
        });
    }

    pub fn flush_events(&self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut self.lock().events)
    }

    pub fn flush_integrations(&self) -> Vec<IntegrationRecord> {
        let mut records: Vec<_> = std::mem::take(&mut self.lock().integrations)
            .into_values()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn flush_configurations(&self) -> Vec<ConfigurationRecord> {
        let mut records: Vec<_> = std::mem::take(&mut self.lock().configurations)
            .into_values()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn flush_logs(&self) -> Vec<LogRecord> {
        let mut records: Vec<_> = std::mem::take(&mut self.lock().logs).into_iter().collect();
        records.sort_by_key(|r| r.tracer_time);
        records
    }

    /// Drains dependencies not yet reported. The all-time seen set survives
    /// the drain, so nothing is ever reported twice.
    pub fn flush_dependencies(&self) -> Vec<DependencyRecord> {
        std::mem::take(&mut self.lock().dependencies)
    }

    /// Drops every queue, the dependency dedup set included. Fork path only.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = QueueState::default();
    }
}

impl Default for EventQueues {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_config_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        scalar @ (serde_json::Value::Null
        | serde_json::Value::Bool(_)
        | serde_json::Value::Number(_)
        | serde_json::Value::String(_)) => scalar,
        other => serde_json::Value::String(other.to_string()),
    }
}
