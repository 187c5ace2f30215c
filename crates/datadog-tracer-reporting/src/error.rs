// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the reporting pipeline.
///
/// None of these ever reach application code through a producer call site;
/// they are confined to reporter construction and to the periodic tick,
/// where they are logged and contained.
#[derive(Debug, thiserror::Error)]
pub enum ReportingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Retry attempts exhausted after {attempts} tries: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Collector does not support this reporting endpoint (status {0})")]
    EndpointUnsupported(u16),

    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,
}

impl From<rmp_serde::encode::Error> for ReportingError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ReportingError::Encode(err.to_string())
    }
}

impl From<serde_json::Error> for ReportingError {
    fn from(err: serde_json::Error) -> Self {
        ReportingError::Encode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ReportingError::InvalidConfig("agentless mode requires an API key".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: agentless mode requires an API key"
        );
    }

    #[test]
    fn test_retries_exhausted_display() {
        let error = ReportingError::RetriesExhausted {
            attempts: 3,
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Retry attempts exhausted after 3 tries: connection refused"
        );
    }

    #[test]
    fn test_endpoint_unsupported_carries_status() {
        let error = ReportingError::EndpointUnsupported(404);
        assert!(error.to_string().contains("404"));
    }
}
