use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// A single violated submission rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Request field the rule applies to (e.g. "url", "retry.max_attempts").
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// All rules violated by a submission, reported together so callers can
/// fix every issue in one round trip.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationFailure {
    pub violations: Vec<Violation>,
}

impl ValidationFailure {
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation::new(field, message));
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for v in &self.violations {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Application-wide error types for the Magpie fetch pipeline.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed request. Never retried.
    #[error("validation failed: {0}")]
    Validation(ValidationFailure),

    /// Fetch timed out.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// Remote peer reset the connection.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Remote endpoint refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Provider-signaled throttling (HTTP 429). The provider-requested
    /// cooldown, when present, is honored as a delay floor.
    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    /// Rejected without a network attempt because the breaker for `key`
    /// is open. Surfaced distinctly so callers can tell "endpoint
    /// unhealthy" from "this attempt failed".
    #[error("circuit '{key}' is open, retry in {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    /// Content could not be extracted at all.
    #[error("parse error: {0}")]
    Parse(String),

    /// Disallowed content (encrypted or oversized documents). Always terminal.
    #[error("security violation: {0}")]
    Security(String),

    /// Unknown job id on a query.
    #[error("not found: {0}")]
    NotFound(String),

    /// Other HTTP-level failure while fetching.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal failure (store, queue, configuration).
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable label used for error-rate-by-type metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Timeout(_) => "timeout",
            AppError::ConnectionReset(_) => "connection_reset",
            AppError::ConnectionRefused(_) => "connection_refused",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::Parse(_) => "parse",
            AppError::Security(_) => "security",
            AppError::NotFound(_) => "not_found",
            AppError::Http(_) => "http",
            AppError::Serialization(_) => "serialization",
            AppError::Internal(_) => "internal",
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Timeout(_)
            | AppError::ConnectionReset(_)
            | AppError::ConnectionRefused(_)
            | AppError::RateLimited { .. }
            | AppError::CircuitOpen { .. }
            | AppError::Parse(_) => true,
            AppError::Http(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("HTTP 5")
            }
            _ => false,
        }
    }

    /// Returns true if this error must never be retried, regardless of
    /// remaining attempts.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppError::Validation(_) | AppError::Security(_))
    }

    /// Returns true if this error should count against the circuit breaker.
    ///
    /// Parse and validation failures mean the endpoint answered, so they
    /// do not indicate endpoint health.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::Timeout(_)
            | AppError::ConnectionReset(_)
            | AppError::ConnectionRefused(_)
            | AppError::RateLimited { .. } => true,
            AppError::Http(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("HTTP 5")
            }
            _ => false,
        }
    }

    /// Minimum delay before the next attempt, when the error carries one
    /// (provider-requested cooldown, remaining breaker-open duration).
    pub fn retry_floor(&self) -> Option<Duration> {
        match self {
            AppError::RateLimited { retry_after } => *retry_after,
            AppError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
