//! Per-service circuit breaker.
//!
//! Tracks recent failures per service and trips open once the count inside
//! the failure window reaches the threshold.  An open circuit rejects
//! calls until the reset timeout elapses, then allows probe requests in
//! half-open state; enough consecutive probe successes close it again.
//!
//! State transitions:
//!
//! - `closed → open` — failure count within `failure_window` reaches
//!   `failure_threshold`.
//! - `open → half_open` — first request after `reset_timeout` has elapsed.
//! - `half_open → closed` — `success_threshold` consecutive successes.
//! - `half_open → open` — any failure; `opened_at` resets to now.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use flowdeck_core::{EngineError, Result};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Circuit state for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// Probe calls are allowed; successes close, any failure re-opens.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Tuning parameters for a circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window required to trip open.
    pub failure_threshold: usize,
    /// Sliding window over which failures are counted.
    pub failure_window: Duration,
    /// How long an open circuit waits before allowing a probe.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Callback invoked on every state transition, for observability.
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Timestamps of recent failures; entries older than the window are
    /// pruned on every write.
    failures: Vec<Instant>,
    successes: u32,
    opened_at: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl Circuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: Vec::new(),
            successes: 0,
            opened_at: None,
            config,
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.failure_window;
        self.failures.retain(|t| now.duration_since(*t) < window);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-scoped registry of per-service circuits.
///
/// Cheaply cloneable; all clones share state.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    circuits: Arc<DashMap<String, Circuit>>,
    default_config: CircuitBreakerConfig,
    on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreakerRegistry {
    /// Create a registry using the default tuning for every service.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a registry with explicit default tuning.
    pub fn with_config(default_config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Arc::new(DashMap::new()),
            default_config,
            on_state_change: None,
        }
    }

    /// Install an observer invoked on every state transition.
    pub fn with_state_change_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Override the tuning for one service.
    pub fn configure(&self, service: impl Into<String>, config: CircuitBreakerConfig) {
        self.circuits
            .insert(service.into(), Circuit::new(config));
    }

    /// Gate a call.  Returns `Ok(())` when the call may proceed.
    ///
    /// # Errors
    ///
    /// Returns a `CIRCUIT_OPEN` error carrying the seconds remaining until
    /// the next probe window when the circuit is open.
    pub fn allow_request(&self, service: &str) -> Result<()> {
        let mut entry = self
            .circuits
            .entry(service.to_string())
            .or_insert_with(|| Circuit::new(self.default_config.clone()));

        let (result, transition) = match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => (Ok(()), None),
            CircuitState::Open => {
                let opened_at = entry.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= entry.config.reset_timeout {
                    let old = entry.state;
                    entry.state = CircuitState::HalfOpen;
                    entry.successes = 0;
                    debug!(service, "circuit half-open, allowing probe");
                    (Ok(()), Some((old, CircuitState::HalfOpen)))
                } else {
                    let remaining = entry.config.reset_timeout - elapsed;
                    let err = EngineError::circuit_open(format!(
                        "circuit for `{service}` is open"
                    ))
                    .with_service(service)
                    .with_retry_after(remaining.as_secs().max(1));
                    (Err(err), None)
                }
            }
        };

        // The callback may call back into the registry; never hold the
        // entry guard across it.
        drop(entry);
        if let Some((old, new)) = transition {
            self.notify(service, old, new);
        }
        result
    }

    /// Record a successful call.
    pub fn record_success(&self, service: &str) {
        let Some(mut entry) = self.circuits.get_mut(service) else {
            return;
        };

        let mut transition = None;
        match entry.state {
            CircuitState::Closed => {
                let now = Instant::now();
                entry.prune(now);
            }
            CircuitState::HalfOpen => {
                entry.successes += 1;
                if entry.successes >= entry.config.success_threshold {
                    let old = entry.state;
                    entry.state = CircuitState::Closed;
                    entry.failures.clear();
                    entry.successes = 0;
                    entry.opened_at = None;
                    debug!(service, "circuit closed after successful probes");
                    transition = Some((old, CircuitState::Closed));
                }
            }
            CircuitState::Open => {}
        }

        drop(entry);
        if let Some((old, new)) = transition {
            self.notify(service, old, new);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, service: &str) {
        let mut entry = self
            .circuits
            .entry(service.to_string())
            .or_insert_with(|| Circuit::new(self.default_config.clone()));

        let now = Instant::now();
        entry.prune(now);
        entry.failures.push(now);

        let mut transition = None;
        match entry.state {
            CircuitState::Closed => {
                if entry.failures.len() >= entry.config.failure_threshold {
                    let old = entry.state;
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(now);
                    entry.successes = 0;
                    warn!(
                        service,
                        failures = entry.failures.len(),
                        "circuit opened"
                    );
                    transition = Some((old, CircuitState::Open));
                }
            }
            CircuitState::HalfOpen => {
                let old = entry.state;
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                entry.successes = 0;
                warn!(service, "probe failed, circuit re-opened");
                transition = Some((old, CircuitState::Open));
            }
            CircuitState::Open => {}
        }

        drop(entry);
        if let Some((old, new)) = transition {
            self.notify(service, old, new);
        }
    }

    /// The current state of a service's circuit (`Closed` if untracked).
    pub fn state(&self, service: &str) -> CircuitState {
        self.circuits
            .get(service)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Reset one service's circuit to closed.
    pub fn reset(&self, service: &str) {
        self.circuits.remove(service);
    }

    /// Reset every circuit.  Intended for tests and engine shutdown.
    pub fn reset_all(&self) {
        self.circuits.clear();
    }

    fn notify(&self, service: &str, old: CircuitState, new: CircuitState) {
        if let Some(callback) = &self.on_state_change {
            callback(service, old, new);
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
