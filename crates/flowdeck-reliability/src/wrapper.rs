//! The reliability wrapper.
//!
//! [`ReliableClient`] decorates a [`ToolClient`] so every call runs the
//! same pipeline:
//!
//! 1. circuit check (open circuits fail fast with `CIRCUIT_OPEN`),
//! 2. input-schema validation (non-retryable `INVALID_CONFIG`),
//! 3. rate-limit acquisition (queue or reject),
//! 4. attempt loop: timeout-bounded call, circuit recording, jittered
//!    exponential backoff between attempts.
//!
//! Server-provided `retry_after` wins over computed backoff.  The wrapper
//! is itself a `ToolClient`, so decoration is invisible to the executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowdeck_core::{EngineError, Result, ToolClient};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::circuit::CircuitBreakerRegistry;
use crate::ratelimit::RateLimiterRegistry;
use crate::validation::SchemaRegistry;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning for the per-call pipeline.
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// HTTP statuses that are retried even when the error kind is not
    /// inherently retryable.
    pub retryable_statuses: Vec<u16>,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

// ---------------------------------------------------------------------------
// ReliableClient
// ---------------------------------------------------------------------------

/// A [`ToolClient`] decorated with the reliability pipeline.
pub struct ReliableClient {
    inner: Arc<dyn ToolClient>,
    service: String,
    config: ReliabilityConfig,
    circuits: CircuitBreakerRegistry,
    limiter: RateLimiterRegistry,
    schemas: SchemaRegistry,
}

impl ReliableClient {
    /// Wrap a client for the named service.
    pub fn new(
        inner: Arc<dyn ToolClient>,
        service: impl Into<String>,
        config: ReliabilityConfig,
        circuits: CircuitBreakerRegistry,
        limiter: RateLimiterRegistry,
        schemas: SchemaRegistry,
    ) -> Self {
        Self {
            inner,
            service: service.into(),
            config,
            circuits,
            limiter,
            schemas,
        }
    }

    /// Delay before retry `attempt` (0-based): the server's `retry_after`
    /// when present, otherwise `initial_delay * 2^attempt` with ±25 %
    /// jitter, clamped to `[0, max_delay]`.
    fn backoff_delay(&self, attempt: u32, error: &EngineError) -> Duration {
        if let Some(secs) = error.retry_after_secs {
            return Duration::from_secs(secs).min(self.config.max_delay);
        }

        let base = self.config.initial_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let delay_ms = (base * jitter).min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    fn should_retry(&self, error: &EngineError) -> bool {
        match error.status_code {
            Some(status) => self.config.retryable_statuses.contains(&status),
            None => error.retryable(),
        }
    }
}

#[async_trait]
impl ToolClient for ReliableClient {
    async fn call_action(&self, path: &str, inputs: Value) -> Result<Value> {
        let full_path = format!("{}.{path}", self.service);

        // 1. Circuit check.
        self.circuits
            .allow_request(&self.service)
            .map_err(|e| e.with_action(&full_path))?;

        // 2. Input validation.  Fails before any token is spent.
        self.schemas.validate(&full_path, &inputs)?;

        // 3. Rate limit.
        self.limiter
            .acquire(&self.service)
            .await
            .map_err(|e| e.with_action(&full_path))?;

        // 4. Attempt loop.
        let mut attempt = 0u32;
        loop {
            let outcome =
                tokio::time::timeout(self.config.timeout, self.inner.call_action(path, inputs.clone()))
                    .await;

            let error = match outcome {
                Ok(Ok(value)) => {
                    self.circuits.record_success(&self.service);
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => EngineError::timeout(format!(
                    "call to `{full_path}` exceeded {:?}",
                    self.config.timeout
                )),
            };

            let retryable = self.should_retry(&error);
            if !retryable || attempt >= self.config.max_retries {
                self.circuits.record_failure(&self.service);
                warn!(
                    service = %self.service,
                    action = %full_path,
                    attempt,
                    error = %error,
                    "call failed"
                );
                return Err(error
                    .with_service(&self.service)
                    .with_action(&full_path));
            }

            let delay = self.backoff_delay(attempt, &error);
            debug!(
                service = %self.service,
                action = %full_path,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;
    use crate::ratelimit::RateLimitConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times, then succeeds.
    struct FlakyClient {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> EngineError,
    }

    impl FlakyClient {
        fn new(failures: u32, error: fn() -> EngineError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
            }
        }
    }

    #[async_trait]
    impl ToolClient for FlakyClient {
        async fn call_action(&self, _path: &str, _inputs: Value) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok(json!({ "ok": true }))
            }
        }
    }

    struct SlowClient;

    #[async_trait]
    impl ToolClient for SlowClient {
        async fn call_action(&self, _path: &str, _inputs: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        }
    }

    fn fast_config() -> ReliabilityConfig {
        ReliabilityConfig {
            timeout: Duration::from_millis(100),
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }

    fn wrap(inner: Arc<dyn ToolClient>, config: ReliabilityConfig) -> ReliableClient {
        ReliableClient::new(
            inner,
            "svc",
            config,
            CircuitBreakerRegistry::new(),
            RateLimiterRegistry::empty(),
            SchemaRegistry::new(),
        )
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let inner = Arc::new(FlakyClient::new(2, || {
            EngineError::network("connection reset")
        }));
        let client = wrap(inner.clone(), fast_config());

        let value = client.call_action("do.thing", json!({})).await.unwrap();
        assert_eq!(value, json!({ "ok": true }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let inner = Arc::new(FlakyClient::new(10, || {
            EngineError::authentication_failed("bad token")
        }));
        let client = wrap(inner.clone(), fast_config());

        let err = client.call_action("do.thing", json!({})).await.unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::AuthenticationFailed);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.action.as_deref(), Some("svc.do.thing"));
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let inner = Arc::new(FlakyClient::new(u32::MAX, || {
            EngineError::network("down")
        }));
        let client = wrap(inner.clone(), fast_config());

        let err = client.call_action("do.thing", json!({})).await.unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::NetworkError);
        // max_retries + 1 attempts, never more.
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retryable_status_codes_drive_retry() {
        let inner = Arc::new(FlakyClient::new(1, || {
            EngineError::from_status(503, "unavailable")
        }));
        let client = wrap(inner.clone(), fast_config());

        client.call_action("do.thing", json!({})).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_fast() {
        let inner = Arc::new(FlakyClient::new(10, || {
            EngineError::from_status(404, "not found")
        }));
        let client = wrap(inner.clone(), fast_config());

        client.call_action("do.thing", json!({})).await.unwrap_err();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_produces_retryable_timeout_error() {
        let config = ReliabilityConfig {
            max_retries: 0,
            ..fast_config()
        };
        let client = wrap(Arc::new(SlowClient), config);

        let err = client.call_action("do.thing", json!({})).await.unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn open_circuit_rejects_before_calling() {
        let circuits = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        circuits.record_failure("svc");

        let inner = Arc::new(FlakyClient::new(0, || EngineError::internal("unused")));
        let client = ReliableClient::new(
            inner.clone(),
            "svc",
            fast_config(),
            circuits,
            RateLimiterRegistry::empty(),
            SchemaRegistry::new(),
        );

        let err = client.call_action("do.thing", json!({})).await.unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::CircuitOpen);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn schema_validation_rejects_before_rate_limit() {
        let schemas = SchemaRegistry::new();
        schemas
            .register(
                "svc.do.thing",
                &json!({ "type": "object", "required": ["name"] }),
            )
            .unwrap();

        let limiter = RateLimiterRegistry::empty();
        limiter.configure("svc", RateLimitConfig::new(1, 60_000));

        let inner = Arc::new(FlakyClient::new(0, || EngineError::internal("unused")));
        let client = ReliableClient::new(
            inner.clone(),
            "svc",
            fast_config(),
            CircuitBreakerRegistry::new(),
            limiter.clone(),
            schemas,
        );

        let err = client.call_action("do.thing", json!({})).await.unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::InvalidConfig);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        // No token was spent on the rejected call.
        assert_eq!(limiter.available("svc"), Some(1));
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures_through_wrapper() {
        let circuits = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        });

        let inner = Arc::new(FlakyClient::new(u32::MAX, || {
            EngineError::authentication_failed("denied")
        }));
        let client = ReliableClient::new(
            inner,
            "svc",
            fast_config(),
            circuits.clone(),
            RateLimiterRegistry::empty(),
            SchemaRegistry::new(),
        );

        client.call_action("a", json!({})).await.unwrap_err();
        client.call_action("a", json!({})).await.unwrap_err();

        // The second recorded failure tripped the circuit.
        let err = client.call_action("a", json!({})).await.unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::CircuitOpen);
    }
}
