// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retrying HTTP delivery to the collector.
//!
//! One reusable `reqwest::Client` with a hard per-request timeout, a status
//! taxonomy that separates transient from permanent failures, and a bounded
//! exponential-backoff retry loop with full jitter. Delivery is at-most-once:
//! a payload whose attempts are exhausted is dropped, never requeued.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, warn};

use crate::error::ReportingError;

/// Golden ratio, the growth factor of the backoff series.
const PHI: f64 = 1.618;

/// Terminal result of a single delivery attempt.
#[derive(Debug)]
pub enum SendOutcome {
    /// 2xx/3xx response.
    Delivered(u16),
    /// Worth retrying: 429, 5xx, connect errors, timeouts.
    TransientFailure(String),
    /// Not worth retrying: other 4xx, or a malformed request. The status is
    /// carried so callers can react to specific codes (404 in particular).
    PermanentFailure { status: Option<u16>, reason: String },
}

/// Exponential backoff schedule sized to a flush interval.
///
/// The waits are chosen so that the full retry series fits comfortably inside
/// one flush interval: the first wait is scaled down by the golden ratio
/// raised to the attempt count, and each subsequent wait grows by the golden
/// ratio. Jitter is applied by the caller, keeping `wait_before` pure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    initial_wait: Duration,
    attempts: u32,
}

impl RetryPolicy {
    pub fn for_interval(interval: Duration, attempts: u32) -> Self {
        let initial_secs = 0.618 * interval.as_secs_f64() / PHI.powi(attempts as i32) / 2.0;
        RetryPolicy {
            initial_wait: Duration::from_secs_f64(initial_secs),
            attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait before attempt `attempt` (0-based), without jitter.
    pub fn wait_before(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.initial_wait.as_secs_f64() * PHI.powi(attempt as i32))
    }
}

/// A single HTTP request, ready to send.
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub struct RetryingTransport {
    client: Client,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self, ReportingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReportingError::Transport(e.to_string()))?;
        Ok(RetryingTransport { client, policy })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// One delivery attempt; never returns `Err`, all failures fold into the
    /// outcome taxonomy.
    pub async fn send_once(&self, request: &TransportRequest) -> SendOutcome {
        let result = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await;

        match result {
            Ok(response) => classify_status(response.status()),
            Err(e) if e.is_timeout() || e.is_connect() => {
                SendOutcome::TransientFailure(e.to_string())
            }
            Err(e) => SendOutcome::PermanentFailure {
                status: None,
                reason: e.to_string(),
            },
        }
    }

    /// Sends with the bounded retry loop. Only transient failures are
    /// retried; each wait gets full jitter so concurrent clients spread out.
    pub async fn send(&self, request: &TransportRequest) -> SendOutcome {
        let mut last_reason = String::new();
        for attempt in 0..self.policy.attempts {
            if attempt > 0 {
                let wait = self.policy.wait_before(attempt);
                let jittered = wait.mul_f64(fastrand::f64());
                tokio::time::sleep(jittered).await;
            }

            match self.send_once(request).await {
                SendOutcome::Delivered(status) => {
                    debug!(url = %request.url, status, "payload delivered");
                    return SendOutcome::Delivered(status);
                }
                SendOutcome::TransientFailure(reason) => {
                    warn!(
                        url = %request.url,
                        attempt = attempt + 1,
                        "transient delivery failure: {}", reason
                    );
                    last_reason = reason;
                }
                permanent @ SendOutcome::PermanentFailure { .. } => return permanent,
            }
        }
        SendOutcome::TransientFailure(last_reason)
    }
}

/// Maps a response status to the delivery outcome taxonomy.
fn classify_status(status: StatusCode) -> SendOutcome {
    let code = status.as_u16();
    if code < 400 {
        return SendOutcome::Delivered(code);
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return SendOutcome::TransientFailure(format!("status {code}"));
    }
    SendOutcome::PermanentFailure {
        status: Some(code),
        reason: format!("status {code}"),
    }
}

/// Builds a header map from static names and owned values, dropping any pair
/// whose value cannot be represented.
pub fn build_headers(pairs: &[(&'static str, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(*name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::OK),
            SendOutcome::Delivered(200)
        ));
        assert!(matches!(
            classify_status(StatusCode::ACCEPTED),
            SendOutcome::Delivered(202)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            SendOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            SendOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            SendOutcome::PermanentFailure {
                status: Some(404),
                ..
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            SendOutcome::PermanentFailure {
                status: Some(400),
                ..
            }
        ));
    }

    #[test]
    fn test_initial_wait_scales_to_interval() {
        let policy = RetryPolicy::for_interval(Duration::from_secs(10), 3);
        let expected = 0.618 * 10.0 / 1.618_f64.powi(3) / 2.0;
        let actual = policy.wait_before(0).as_secs_f64();
        assert!((actual - expected).abs() < 1e-9);
    }

    #[test]
    fn test_wait_before_grows_by_golden_ratio() {
        let policy = RetryPolicy::for_interval(Duration::from_secs(10), 3);
        let w0 = policy.wait_before(0).as_secs_f64();
        let w1 = policy.wait_before(1).as_secs_f64();
        let w2 = policy.wait_before(2).as_secs_f64();
        assert!((w1 / w0 - PHI).abs() < 1e-9);
        assert!((w2 / w1 - PHI).abs() < 1e-9);
    }

    #[test]
    fn test_wait_before_is_pure() {
        let policy = RetryPolicy::for_interval(Duration::from_secs(10), 3);
        assert_eq!(policy.wait_before(2), policy.wait_before(2));
    }

    #[test]
    fn test_retry_series_fits_within_interval() {
        let interval = Duration::from_secs(10);
        let policy = RetryPolicy::for_interval(interval, 3);
        let total: f64 = (0..3).map(|a| policy.wait_before(a).as_secs_f64()).sum();
        assert!(total < interval.as_secs_f64());
    }
}
