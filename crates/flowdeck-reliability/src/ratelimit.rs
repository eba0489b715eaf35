//! Per-service token-bucket rate limiter.
//!
//! Tokens refill smoothly at `max_requests / window_ms`.  When the bucket
//! is empty, strategy `queue` parks the caller in a FIFO serviced by a
//! background drain task; strategy `reject` fails immediately.  A full
//! queue fails with `RATE_LIMITED` regardless of strategy.
//!
//! Response headers can clamp a bucket downward to the server's own view
//! of the remaining quota via [`RateLimiterRegistry::update_from_headers`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use flowdeck_core::{EngineError, Result};
use tokio::sync::oneshot;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What happens when the bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitStrategy {
    /// Park the caller until a token refills (FIFO order).
    #[default]
    Queue,
    /// Fail immediately with `RATE_LIMITED`.
    Reject,
}

/// Tuning for one service's bucket.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens available per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Behavior when the bucket is empty.
    pub strategy: RateLimitStrategy,
    /// Maximum parked waiters before the queue itself rejects.
    pub max_queue_size: usize,
}

impl RateLimitConfig {
    /// A queueing config with the given request budget.
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            strategy: RateLimitStrategy::Queue,
            max_queue_size: 100,
        }
    }

    /// Switch to the reject strategy.
    pub fn rejecting(mut self) -> Self {
        self.strategy = RateLimitStrategy::Reject;
        self
    }
}

/// Pre-seeded budgets for well-known services.  User overrides replace
/// these wholesale.
fn known_defaults() -> Vec<(&'static str, RateLimitConfig)> {
    vec![
        ("slack", RateLimitConfig::new(50, 60_000)),
        ("github", RateLimitConfig::new(5_000, 3_600_000)),
        ("gmail", RateLimitConfig::new(25, 1_000)),
        ("discord", RateLimitConfig::new(50, 1_000)),
        ("notion", RateLimitConfig::new(3, 1_000)),
        ("telegram", RateLimitConfig::new(30, 1_000)),
        ("linear", RateLimitConfig::new(1_500, 3_600_000)),
    ]
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

struct Bucket {
    /// Fractional tokens currently available, clamped to `[0, max]`.
    available: f64,
    max: f64,
    refill_per_ms: f64,
    last_refill: Instant,
    queue: VecDeque<oneshot::Sender<()>>,
    /// Whether a drain task is currently servicing the queue.
    timer_running: bool,
    config: RateLimitConfig,
}

impl Bucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            available: config.max_requests as f64,
            max: config.max_requests as f64,
            refill_per_ms: config.max_requests as f64 / config.window_ms as f64,
            last_refill: Instant::now(),
            queue: VecDeque::new(),
            timer_running: false,
            config,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1_000.0;
        self.available = (self.available + elapsed_ms * self.refill_per_ms).min(self.max);
        self.last_refill = now;
    }

    /// Milliseconds until one whole token is available.
    fn ms_until_token(&self) -> u64 {
        if self.available >= 1.0 {
            return 0;
        }
        ((1.0 - self.available) / self.refill_per_ms).ceil() as u64
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-scoped registry of per-service token buckets.
#[derive(Clone)]
pub struct RateLimiterRegistry {
    buckets: Arc<DashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiterRegistry {
    /// Create a registry pre-seeded with the known service defaults.
    pub fn new() -> Self {
        let registry = Self::empty();
        for (service, config) in known_defaults() {
            registry.configure(service, config);
        }
        registry
    }

    /// Create a registry with no buckets at all (services are unlimited
    /// until configured).
    pub fn empty() -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
        }
    }

    /// Install (or replace) the bucket for a service.
    ///
    /// Replacing an existing bucket drops its parked waiters; they resolve
    /// with a cancellation error.
    pub fn configure(&self, service: impl Into<String>, config: RateLimitConfig) {
        let service = service.into();
        debug!(
            service = %service,
            max_requests = config.max_requests,
            window_ms = config.window_ms,
            "rate limit configured"
        );
        self.buckets
            .insert(service, Arc::new(Mutex::new(Bucket::new(config))));
    }

    /// Remove the bucket for a service, draining its waiters.
    pub fn remove(&self, service: &str) {
        self.buckets.remove(service);
    }

    /// Remove every bucket.  Intended for tests and engine shutdown.
    pub fn reset_all(&self) {
        self.buckets.clear();
    }

    /// Acquire one token for a service.
    ///
    /// Returns immediately when the service has no bucket or a token is
    /// available.  Otherwise the configured strategy applies.
    ///
    /// # Errors
    ///
    /// `RATE_LIMITED` when the strategy is `reject` and the bucket is
    /// empty, or when the waiter queue is full.
    pub async fn acquire(&self, service: &str) -> Result<()> {
        let Some(bucket) = self.buckets.get(service).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };

        let receiver = {
            let mut state = bucket
                .lock()
                .map_err(|_| EngineError::internal("rate limiter mutex poisoned"))?;
            state.refill();

            if state.available >= 1.0 {
                state.available -= 1.0;
                return Ok(());
            }

            if state.queue.len() >= state.config.max_queue_size {
                return Err(EngineError::rate_limited(format!(
                    "rate limit queue full for `{service}`"
                ))
                .with_service(service));
            }

            match state.config.strategy {
                RateLimitStrategy::Reject => {
                    let wait_ms = state.ms_until_token();
                    return Err(EngineError::rate_limited(format!(
                        "rate limit exceeded for `{service}`"
                    ))
                    .with_service(service)
                    .with_retry_after(wait_ms.div_ceil(1_000).max(1)));
                }
                RateLimitStrategy::Queue => {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back(tx);
                    if !state.timer_running {
                        state.timer_running = true;
                        spawn_drain_task(service.to_string(), Arc::clone(&bucket));
                    }
                    rx
                }
            }
        };

        trace!(service, "parked on rate limit queue");
        receiver.await.map_err(|_| {
            EngineError::internal(format!(
                "rate limit waiter for `{service}` cancelled: bucket destroyed"
            ))
        })
    }

    /// Clamp a bucket downward from response headers.
    ///
    /// Recognizes `x-ratelimit-remaining` (with `x-rate-limit-remaining`
    /// as an alias); the server's view only ever lowers the local count.
    pub fn update_from_headers(&self, service: &str, headers: &HashMap<String, String>) {
        let Some(bucket) = self.buckets.get(service).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let remaining = headers
            .iter()
            .find(|(k, _)| {
                let k = k.to_ascii_lowercase();
                k == "x-ratelimit-remaining" || k == "x-rate-limit-remaining"
            })
            .and_then(|(_, v)| v.trim().parse::<f64>().ok());

        if let Some(remaining) = remaining
            && let Ok(mut state) = bucket.lock()
        {
            state.refill();
            if remaining < state.available {
                trace!(
                    service,
                    local = state.available,
                    server = remaining,
                    "clamping bucket to server view"
                );
                state.available = remaining.max(0.0);
            }
        }
    }

    /// Whole tokens currently available (`None` when unconfigured).
    pub fn available(&self, service: &str) -> Option<u64> {
        let bucket = self.buckets.get(service).map(|e| Arc::clone(e.value()))?;
        let mut state = bucket.lock().ok()?;
        state.refill();
        Some(state.available as u64)
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Services the FIFO until the queue empties, sleeping just long enough
/// for the next whole token each round.
fn spawn_drain_task(service: String, bucket: Arc<Mutex<Bucket>>) {
    tokio::spawn(async move {
        loop {
            let sleep_ms = {
                let Ok(mut state) = bucket.lock() else { return };
                state.refill();

                while state.available >= 1.0 {
                    let Some(waiter) = state.queue.pop_front() else {
                        break;
                    };
                    // A send failure means the waiter was dropped
                    // (cancelled); its token stays in the bucket.
                    if waiter.send(()).is_ok() {
                        state.available -= 1.0;
                    }
                }

                if state.queue.is_empty() {
                    state.timer_running = false;
                    return;
                }
                state.ms_until_token().max(1)
            };

            trace!(service = %service, sleep_ms, "rate limit drain sleeping");
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
