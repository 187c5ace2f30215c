// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic delivery of span statistics to the collector.
//!
//! The reporter owns the aggregator behind a mutex, drains it on every tick,
//! and PUTs the msgpack payload to `/v0.6/stats`. A collector that answers
//! 404 does not compute stats; the reporter then disables itself for the
//! rest of the process lifetime so producers pay nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Serialize;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::ReportingError;
use crate::scheduler::{PeriodicService, PeriodicTask};
use crate::state::{ProcessGeneration, ReporterState};
use crate::stats::aggregator::{FinishedSpan, SpanStatsAggregator, WireStatsBucket};
use crate::transport::{build_headers, RetryPolicy, RetryingTransport, SendOutcome, TransportRequest};

/// Top-level `/v0.6/stats` payload.
#[derive(Debug, Serialize)]
struct WireStatsPayload {
    #[serde(rename = "Stats")]
    stats: Vec<WireStatsBucket>,
    #[serde(rename = "Hostname", skip_serializing_if = "String::is_empty")]
    hostname: String,
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    env: Option<String>,
    #[serde(rename = "Version", skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

pub struct SpanStatsReporter {
    endpoint: String,
    headers: HeaderMap,
    hostname: String,
    env: Option<String>,
    version: Option<String>,
    aggregator: Mutex<SpanStatsAggregator>,
    transport: RetryingTransport,
    service: PeriodicService,
    state: Arc<ReporterState>,
    generation: ProcessGeneration,
    enabled: AtomicBool,
}

impl SpanStatsReporter {
    pub fn new(config: &Config, state: Arc<ReporterState>) -> Result<Self, ReportingError> {
        config.validate()?;
        let policy = RetryPolicy::for_interval(config.stats_flush_interval, config.retry_attempts);
        let transport = RetryingTransport::new(config.request_timeout, policy)?;
        let headers = build_headers(&[
            ("Content-Type", "application/msgpack".to_string()),
            ("Datadog-Meta-Lang", config.language.clone()),
            ("Datadog-Meta-Tracer-Version", config.tracer_version.clone()),
        ]);

        Ok(SpanStatsReporter {
            endpoint: config.stats_endpoint(),
            headers,
            hostname: if config.report_hostname {
                config.hostname.clone()
            } else {
                String::new()
            },
            env: config.env.clone(),
            version: config.version.clone(),
            aggregator: Mutex::new(SpanStatsAggregator::new(
                config.stats_flush_interval.as_nanos() as u64,
            )),
            transport,
            service: PeriodicService::new(config.stats_flush_interval),
            state,
            generation: ProcessGeneration::new(),
            enabled: AtomicBool::new(true),
        })
    }

    pub fn start(self: Arc<Self>) {
        let task: Arc<dyn PeriodicTask> = self.clone();
        self.service.start(task);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Producer entry point. Lock-and-mutate only, no serialization, no I/O.
    pub fn on_span_finish(&self, span: &FinishedSpan) {
        if !self.enabled() {
            return;
        }
        self.aggregator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(span);
    }

    /// Discards buckets inherited from the parent process. The host calls
    /// this in a forked child (then `start()` to re-arm the loop); the tick
    /// path also invokes it when it detects the generation change itself.
    pub fn handle_fork(&self) {
        self.aggregator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.generation.mark_current();
        self.state.mark_forked();
        debug!("span stats reset after fork");
    }

    /// Final bounded drain, then stops the periodic loop.
    pub async fn shutdown(self: Arc<Self>, timeout: Duration) -> Result<(), ReportingError> {
        let task: Arc<dyn PeriodicTask> = self.clone();
        self.service.shutdown(task, timeout).await
    }

    async fn flush(&self) -> Result<(), ReportingError> {
        let buckets = {
            let mut aggregator = self.aggregator.lock().unwrap_or_else(|e| e.into_inner());
            if aggregator.is_empty() {
                return Ok(());
            }
            aggregator.serialize_and_drain()?
        };

        let payload = WireStatsPayload {
            stats: buckets,
            hostname: self.hostname.clone(),
            env: self.env.clone(),
            version: self.version.clone(),
        };
        let request = TransportRequest {
            method: Method::PUT,
            url: self.endpoint.clone(),
            headers: self.headers.clone(),
            body: rmp_serde::to_vec_named(&payload)?,
        };

        match self.transport.send(&request).await {
            SendOutcome::Delivered(_) => Ok(()),
            SendOutcome::TransientFailure(reason) => Err(ReportingError::RetriesExhausted {
                attempts: self.transport.policy().attempts(),
                reason,
            }),
            SendOutcome::PermanentFailure {
                status: Some(404), ..
            } => {
                self.enabled.store(false, Ordering::Relaxed);
                error!("collector does not support span stats computation, disabling the reporter");
                Err(ReportingError::EndpointUnsupported(404))
            }
            SendOutcome::PermanentFailure { reason, .. } => {
                Err(ReportingError::Transport(reason))
            }
        }
    }
}

#[async_trait::async_trait]
impl PeriodicTask for SpanStatsReporter {
    async fn tick(&self, _shutting_down: bool) -> Result<(), ReportingError> {
        if !self.enabled() {
            return Ok(());
        }
        if self.generation.changed() {
            self.handle_fork();
            return Ok(());
        }
        self.flush().await
    }

    fn name(&self) -> &'static str {
        "span-stats-reporter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(agent_url: &str) -> Config {
        Config {
            agent_url: agent_url.to_string(),
            env: Some("staging".to_string()),
            version: Some("3.1.4".to_string()),
            ..Config::default()
        }
    }

    fn top_level_span() -> FinishedSpan {
        FinishedSpan {
            name: "web.request".to_string(),
            service: "billing".to_string(),
            resource: "GET /charges".to_string(),
            span_type: "web".to_string(),
            http_status_code: 200,
            synthetics: false,
            top_level: true,
            measured: false,
            error: false,
            start_ns: 1_700_000_000_000_000_000,
            duration_ns: 250_000,
        }
    }

    #[tokio::test]
    async fn test_empty_tick_sends_nothing() {
        // No server is listening on this port; an attempted send would fail
        // the tick, so success proves the empty aggregator short-circuits.
        let state = Arc::new(ReporterState::new());
        let reporter = SpanStatsReporter::new(&test_config("http://127.0.0.1:9"), state).unwrap();
        reporter.tick(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_reporter_drops_spans() {
        let state = Arc::new(ReporterState::new());
        let reporter = SpanStatsReporter::new(&test_config("http://127.0.0.1:9"), state).unwrap();
        reporter.enabled.store(false, Ordering::Relaxed);
        reporter.on_span_finish(&top_level_span());
        assert!(reporter
            .aggregator
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_fork_discards_inherited_buckets() {
        let state = Arc::new(ReporterState::new());
        let reporter =
            SpanStatsReporter::new(&test_config("http://127.0.0.1:9"), Arc::clone(&state)).unwrap();
        reporter.on_span_finish(&top_level_span());
        assert!(!reporter.aggregator.lock().unwrap().is_empty());

        reporter.handle_fork();
        assert!(reporter.aggregator.lock().unwrap().is_empty());
        assert!(state.forked());
    }

    #[tokio::test]
    async fn test_tick_detects_fork_even_after_peer_reset() {
        let state = Arc::new(ReporterState::new());
        let reporter =
            SpanStatsReporter::new(&test_config("http://127.0.0.1:9"), Arc::clone(&state)).unwrap();
        reporter.on_span_finish(&top_level_span());

        // Simulate buckets inherited by a forked child in which another
        // reporter sharing this state has already observed the new pid.
        reporter.generation.record(0);
        state.mark_forked();

        reporter.tick(false).await.unwrap();
        assert!(reporter.aggregator.lock().unwrap().is_empty());
        assert!(!reporter.generation.changed());
    }

    #[test]
    fn test_hostname_omitted_unless_requested() {
        let payload = WireStatsPayload {
            stats: vec![],
            hostname: String::new(),
            env: None,
            version: None,
        };
        let encoded = rmp_serde::to_vec_named(&payload).unwrap();
        let decoded: serde_json::Value = rmp_serde::from_slice(&encoded).unwrap();
        let map = decoded.as_object().unwrap();
        assert!(map.contains_key("Stats"));
        assert!(!map.contains_key("Hostname"));
        assert!(!map.contains_key("Env"));
    }
}
