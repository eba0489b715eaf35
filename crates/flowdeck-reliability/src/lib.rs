//! Reliability layer for Flowdeck tool calls.
//!
//! The [`wrapper::ReliableClient`] decorates any
//! [`flowdeck_core::ToolClient`] so every outbound call passes through a
//! fixed pipeline: circuit check, input-schema validation, rate-limit
//! acquisition, then an attempt loop with timeouts and jittered backoff.
//! Outcomes feed the per-service [`circuit::CircuitBreakerRegistry`] so a
//! failing service trips open instead of being hammered.
//!
//! The circuit and rate-limiter registries are process-scoped objects
//! constructed at engine init and shared by reference into every wrapper;
//! tests reset them explicitly.

pub mod circuit;
pub mod ratelimit;
pub mod validation;
pub mod wrapper;

pub use circuit::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use ratelimit::{RateLimitConfig, RateLimitStrategy, RateLimiterRegistry};
pub use validation::SchemaRegistry;
pub use wrapper::{ReliabilityConfig, ReliableClient};
