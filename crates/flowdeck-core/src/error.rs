//! Engine error taxonomy.
//!
//! Every failure in the system is normalized into an [`EngineError`]: a
//! classification [`ErrorKind`], a human-readable message, and optional
//! context (service, action path, HTTP status, server-provided retry delay,
//! and the original cause).  The reliability wrapper and the engine's retry
//! policy both branch on [`EngineError::retryable`] rather than inspecting
//! message strings.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Classification of a failure.
///
/// The kind determines retryability: transient transport-level failures
/// (rate limits, network errors, timeouts, open circuits) are retryable,
/// everything else is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Schema or validation failure, missing required configuration.
    InvalidConfig,
    /// The service rejected the credentials (401 or equivalent).
    AuthenticationFailed,
    /// The credentials lack permission for the operation (403 or equivalent).
    AuthorizationFailed,
    /// The service or the local limiter refused the call (429).
    RateLimited,
    /// DNS failure, connection refused, or connection reset.
    NetworkError,
    /// A deadline was exceeded or the call was aborted.
    Timeout,
    /// The named SDK or tool is not registered.
    ProviderNotFound,
    /// Duplicate registration of a tool or event-source id.
    ProviderConflict,
    /// The provider does not support the requested feature.
    UnsupportedCapability,
    /// Template or predicate evaluation failed.
    ExpressionError,
    /// The service is currently circuit-broken.
    CircuitOpen,
    /// Uncategorized fallback.
    InternalError,
}

impl ErrorKind {
    /// Whether failures of this kind are worth retrying.
    ///
    /// `CircuitOpen` is retryable in the sense that the call may succeed
    /// after the circuit's reset window elapses; callers should honor the
    /// accompanying `retry_after_secs`.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::NetworkError | Self::Timeout | Self::CircuitOpen
        )
    }

    /// The canonical wire name for this kind (e.g. `RATE_LIMITED`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AuthorizationFailed => "AUTHORIZATION_FAILED",
            Self::RateLimited => "RATE_LIMITED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ProviderNotFound => "PROVIDER_NOT_FOUND",
            Self::ProviderConflict => "PROVIDER_CONFLICT",
            Self::UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
            Self::ExpressionError => "EXPRESSION_ERROR",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Unified error type for the Flowdeck engine.
///
/// Constructed through the per-kind helpers ([`EngineError::invalid_config`],
/// [`EngineError::timeout`], …) and enriched with context via the `with_*`
/// builders.  The original cause, when present, is chained through
/// `std::error::Error::source` so callers can assert on both the outer
/// message and the inner kind.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// The service the call was addressed to, if known.
    pub service: Option<String>,
    /// The dotted action path being invoked, if known.
    pub action: Option<String>,
    /// HTTP status, when the failure originated from an HTTP response.
    pub status_code: Option<u16>,
    /// Server-provided retry delay in seconds (rate limits, open circuits).
    pub retry_after_secs: Option<u64>,
    /// The underlying cause, when the failure wraps another error.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    /// Create an error of the given kind with a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            service: None,
            action: None,
            status_code: None,
            retry_after_secs: None,
            source: None,
        }
    }

    // -- Per-kind constructors ----------------------------------------------

    /// Schema/validation failure or missing required configuration.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    /// The service rejected the credentials.
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationFailed, message)
    }

    /// The credentials lack permission for the operation.
    pub fn authorization_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthorizationFailed, message)
    }

    /// The service or the local limiter refused the call.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    /// DNS failure, connection refused, or connection reset.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    /// A deadline was exceeded or the call was aborted.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// The named SDK or tool is not registered.
    pub fn provider_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderNotFound, message)
    }

    /// Duplicate registration of a tool or event-source id.
    pub fn provider_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderConflict, message)
    }

    /// The provider does not support the requested feature.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedCapability, message)
    }

    /// Template or predicate evaluation failed.
    pub fn expression(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExpressionError, message)
    }

    /// The service is currently circuit-broken.
    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    /// Uncategorized internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    // -- Context builders ---------------------------------------------------

    /// Attach the service name the call was addressed to.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Attach the dotted action path being invoked.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Attach the HTTP status the failure originated from.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Attach a server-provided retry delay in seconds.
    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    /// Attach the underlying cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // -- Classification -----------------------------------------------------

    /// Classify an HTTP status code into an error of the appropriate kind.
    ///
    /// 401 → authentication, 403 → authorization, 429 → rate limited,
    /// 5xx → network (retryable), anything else 4xx → invalid config.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 => ErrorKind::AuthenticationFailed,
            403 => ErrorKind::AuthorizationFailed,
            429 => ErrorKind::RateLimited,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::NetworkError,
            400..=499 => ErrorKind::InvalidConfig,
            _ => ErrorKind::InternalError,
        };
        Self::new(kind, message).with_status(status)
    }

    /// Whether this failure is worth retrying.
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("json error: {e}")).with_source(e)
    }
}

/// Convenience alias used throughout the Flowdeck crates.
pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
