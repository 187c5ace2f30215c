// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Instrumentation telemetry pipeline: metrics, event queues, and the
//! periodic reporter that delivers them.

pub mod events;
pub mod metrics;
pub mod reporter;

pub use events::{
    ConfigurationRecord, DependencyRecord, EventQueues, IntegrationRecord, LogLevel, LogRecord,
    PayloadType, TelemetryEvent,
};
pub use metrics::{MetricKind, MetricStore};
pub use reporter::{Product, TelemetryReporter};
