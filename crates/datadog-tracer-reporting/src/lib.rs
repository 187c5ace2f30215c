// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background reporting pipeline for the tracer.
//!
//! Two independent reporters run on the tokio runtime, each driven by its own
//! periodic loop:
//!
//! - [`stats::SpanStatsReporter`] collapses finished spans into time-bucketed
//!   aggregates and PUTs them to the collector's `/v0.6/stats` endpoint as
//!   msgpack.
//! - [`telemetry::TelemetryReporter`] buffers internal metrics, logs,
//!   integration and configuration changes, and POSTs them as discrete JSON
//!   events, with a heartbeat on every flush.
//!
//! Producer entry points (`on_span_finish`, `add_*`) only lock and mutate
//! in-memory state; serialization and network I/O happen on the scheduler
//! tasks. Delivery is at-most-once through a shared retrying transport.
//!
//! Both reporters share an [`state::ReporterState`] that tracks the telemetry
//! sequence, the runtime id, and the process generation used to reset
//! inherited state after a fork.

pub mod config;
pub mod error;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use error::ReportingError;
pub use scheduler::{PeriodicService, PeriodicTask, ServiceStatus};
pub use state::ReporterState;
pub use stats::{FinishedSpan, SpanStatsReporter};
pub use telemetry::{
    IntegrationRecord, LogLevel, MetricKind, PayloadType, Product, TelemetryReporter,
};
