// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolved reporting settings.
//!
//! The tracer's configuration layer (env vars, code, remote config) resolves
//! precedence upstream; this crate only consumes the resulting scalars. The
//! struct also derives the two collector endpoints used by the reporters.

use std::time::Duration;

use crate::error::ReportingError;

/// Agent-proxied telemetry path, relative to the collector base URL.
const TELEMETRY_AGENT_ENDPOINT: &str = "/telemetry/proxy/api/v2/apmtelemetry";
/// Path on the direct intake host used in agentless mode.
const TELEMETRY_AGENTLESS_ENDPOINT: &str = "/api/v2/apmtelemetry";
/// Stats computation endpoint on the collector.
const STATS_ENDPOINT: &str = "/v0.6/stats";

#[derive(Debug, Clone)]
pub struct Config {
    /// Collector (agent) base URL, e.g. `http://localhost:8126`.
    pub agent_url: String,
    /// Intake site used to build the direct telemetry host in agentless mode.
    pub site: String,
    pub api_key: Option<String>,
    /// Deliver telemetry directly to the intake instead of the local agent.
    pub agentless: bool,
    /// Span stats flush cadence; also the aggregation bucket duration.
    pub stats_flush_interval: Duration,
    pub telemetry_flush_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Hard timeout for each collector request.
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub telemetry_enabled: bool,
    pub dependency_collection: bool,
    pub report_hostname: bool,
    pub hostname: String,
    pub service: String,
    pub env: Option<String>,
    pub version: Option<String>,
    pub tracer_version: String,
    pub language: String,
    pub language_version: String,
    /// Marks every telemetry payload as debug for backend-side tracing.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent_url: "http://localhost:8126".to_string(),
            site: "datadoghq.com".to_string(),
            api_key: None,
            agentless: false,
            stats_flush_interval: Duration::from_secs(10),
            telemetry_flush_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            telemetry_enabled: true,
            dependency_collection: true,
            report_hostname: false,
            hostname: String::new(),
            service: "unnamed-rust-service".to_string(),
            env: None,
            version: None,
            tracer_version: env!("CARGO_PKG_VERSION").to_string(),
            language: "rust".to_string(),
            language_version: option_env!("CARGO_PKG_RUST_VERSION")
                .unwrap_or("unknown")
                .to_string(),
            debug: false,
        }
    }
}

impl Config {
    /// Checks internal consistency of the resolved settings.
    pub fn validate(&self) -> Result<(), ReportingError> {
        if self.agentless && self.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ReportingError::InvalidConfig(
                "agentless mode requires an API key".to_string(),
            ));
        }
        if self.stats_flush_interval.is_zero() || self.telemetry_flush_interval.is_zero() {
            return Err(ReportingError::InvalidConfig(
                "flush intervals must be non-zero".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ReportingError::InvalidConfig(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Full URL for span stats payloads.
    pub fn stats_endpoint(&self) -> String {
        format!("{}{}", self.agent_url.trim_end_matches('/'), STATS_ENDPOINT)
    }

    /// Full URL for telemetry events, agent-proxied or direct intake.
    pub fn telemetry_endpoint(&self) -> String {
        if self.agentless {
            format!(
                "https://instrumentation-telemetry-intake.{}{}",
                self.site, TELEMETRY_AGENTLESS_ENDPOINT
            )
        } else {
            format!(
                "{}{}",
                self.agent_url.trim_end_matches('/'),
                TELEMETRY_AGENT_ENDPOINT
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints() {
        let config = Config::default();
        assert_eq!(config.stats_endpoint(), "http://localhost:8126/v0.6/stats");
        assert_eq!(
            config.telemetry_endpoint(),
            "http://localhost:8126/telemetry/proxy/api/v2/apmtelemetry"
        );
    }

    #[test]
    fn test_trailing_slash_is_normalized() {
        let config = Config {
            agent_url: "http://127.0.0.1:8126/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.stats_endpoint(), "http://127.0.0.1:8126/v0.6/stats");
    }

    #[test]
    fn test_agentless_endpoint_uses_site() {
        let config = Config {
            agentless: true,
            api_key: Some("_not_a_real_key_".to_string()),
            site: "datadoghq.eu".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.telemetry_endpoint(),
            "https://instrumentation-telemetry-intake.datadoghq.eu/api/v2/apmtelemetry"
        );
    }

    #[test]
    fn test_validate_rejects_agentless_without_api_key() {
        let config = Config {
            agentless: true,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReportingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = Config {
            stats_flush_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retry_attempts() {
        // Zero attempts would make every send fail without touching the wire.
        let config = Config {
            retry_attempts: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReportingError::InvalidConfig(_))
        ));
    }
}
