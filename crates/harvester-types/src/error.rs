//! Structured error model for connector operations.
//!
//! [`ConnectorError`] carries classification, retry metadata, and optional
//! diagnostic details. Construct via category-specific factory methods; the
//! engine classifies the category into a processing outcome at the pipeline
//! boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a connector error.
///
/// Determines how the engine reacts: reschedule, fail the document, or
/// abort the owning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid connector configuration.
    Config,
    /// Authentication failure.
    Auth,
    /// Insufficient permissions.
    Permission,
    /// Connector could not be set up (missing driver, bad environment).
    Setup,
    /// Rate limit exceeded (retryable).
    RateLimit,
    /// Transient network error (retryable).
    TransientNetwork,
    /// Remote service temporarily unavailable (retryable).
    TransientService,
    /// The document itself cannot be processed.
    Document,
    /// Invalid or corrupt data.
    Data,
    /// Internal connector error.
    Internal,
    /// The operation was interrupted by cancellation.
    Interrupted,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::Setup => "setup",
            Self::RateLimit => "rate_limit",
            Self::TransientNetwork => "transient_network",
            Self::TransientService => "transient_service",
            Self::Document => "document",
            Self::Data => "data",
            Self::Internal => "internal",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffClass {
    /// Millisecond-scale retry.
    Fast,
    /// Second-scale retry.
    Normal,
    /// Minute-scale retry.
    Slow,
}

/// Connector check outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Success,
    Failed,
    Warning,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Warning => "warning",
        })
    }
}

/// Result of a connector `check()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub message: String,
}

impl ValidationResult {
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Success,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Failed,
            message: message.into(),
        }
    }
}

/// Structured error from a connector operation.
///
/// Carries classification, retry metadata, and optional diagnostic details.
/// Construct via category-specific factory methods (e.g., [`ConnectorError::config`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct ConnectorError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub backoff_class: BackoffClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ConnectorError {
    fn new(
        category: ErrorCategory,
        retryable: bool,
        backoff_class: BackoffClass,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
            backoff_class,
            details: None,
        }
    }

    /// Configuration error (not retryable).
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, false, BackoffClass::Normal, code, message)
    }

    /// Authentication error (not retryable).
    #[must_use]
    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, false, BackoffClass::Normal, code, message)
    }

    /// Permission error (not retryable).
    #[must_use]
    pub fn permission(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permission, false, BackoffClass::Normal, code, message)
    }

    /// Setup error (not retryable).
    #[must_use]
    pub fn setup(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Setup, false, BackoffClass::Normal, code, message)
    }

    /// Rate limit error (retryable, slow backoff).
    #[must_use]
    pub fn rate_limit(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimit, true, BackoffClass::Slow, code, message);
        err.retry_after_ms = retry_after_ms;
        err
    }

    /// Transient network error (retryable, normal backoff).
    #[must_use]
    pub fn transient_network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransientNetwork, true, BackoffClass::Normal, code, message)
    }

    /// Remote service interruption (retryable). A suggested delay, when the
    /// service provides one, overrides computed backoff.
    #[must_use]
    pub fn service_interruption(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let mut err = Self::new(
            ErrorCategory::TransientService,
            true,
            BackoffClass::Normal,
            code,
            message,
        );
        err.retry_after_ms = retry_after_ms;
        err
    }

    /// The document cannot be processed (not retryable).
    #[must_use]
    pub fn document(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Document, false, BackoffClass::Normal, code, message)
    }

    /// Data validation error (not retryable).
    #[must_use]
    pub fn data(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Data, false, BackoffClass::Normal, code, message)
    }

    /// Internal connector error (not retryable).
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, false, BackoffClass::Normal, code, message)
    }

    /// Cancellation observed inside the connector.
    #[must_use]
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Interrupted, false, BackoffClass::Fast, "INTERRUPTED", message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a suggested retry delay.
    #[must_use]
    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// Override the default backoff class.
    #[must_use]
    pub fn with_backoff(mut self, backoff_class: BackoffClass) -> Self {
        self.backoff_class = backoff_class;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_defaults() {
        let err = ConnectorError::config("MISSING_ROOT", "root is required");
        assert_eq!(err.category, ErrorCategory::Config);
        assert!(!err.retryable);
        assert_eq!(err.backoff_class, BackoffClass::Normal);
        assert!(err.retry_after_ms.is_none());
    }

    #[test]
    fn transient_errors_are_retryable() {
        let net = ConnectorError::transient_network("TIMEOUT", "timed out");
        assert!(net.retryable);

        let svc = ConnectorError::service_interruption("UNAVAILABLE", "503", Some(30_000));
        assert!(svc.retryable);
        assert_eq!(svc.retry_after_ms, Some(30_000));
    }

    #[test]
    fn rate_limit_uses_slow_backoff() {
        let err = ConnectorError::rate_limit("THROTTLED", "slow down", None);
        assert_eq!(err.backoff_class, BackoffClass::Slow);
        assert!(err.retryable);
    }

    #[test]
    fn serde_roundtrip() {
        let err = ConnectorError::rate_limit("THROTTLED", "slow down", Some(5000))
            .with_details(serde_json::json!({"host": "example.com"}));
        let json = serde_json::to_string(&err).unwrap();
        let back: ConnectorError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn display_format() {
        let err = ConnectorError::document("TOO_LARGE", "document exceeds limit");
        assert_eq!(err.to_string(), "[document] TOO_LARGE: document exceeds limit");
    }
}
