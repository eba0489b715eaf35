//! The `event` built-in SDK.
//!
//! Bridges workflow actions to the event-source manager without the
//! registry depending on it: the manager implements [`EventBridge`] and is
//! installed at engine setup.  Actions:
//!
//! - `event.connect` — register and start a source.
//! - `event.wait` — block until a matching event arrives (daemon mode).
//! - `event.send` — send outbound data through a source (WebSocket).
//! - `event.disconnect` — stop and remove a source.

use std::sync::Arc;

use async_trait::async_trait;
use flowdeck_core::workflow::{EventSourceConfig, EventSourceEvent};
use flowdeck_core::{EngineError, Result, ToolClient};
use serde_json::{Value, json};

/// Implemented by the event-source manager.
#[async_trait]
pub trait EventBridge: Send + Sync {
    /// Register and connect a source.  Duplicate ids are rejected.
    async fn add_source(&self, config: EventSourceConfig) -> Result<()>;

    /// Stop and deregister a source.
    async fn remove_source(&self, id: &str) -> Result<()>;

    /// Wait for the next event matching the filters, up to `timeout_ms`.
    async fn wait_for_event(
        &self,
        source: Option<String>,
        event_type: Option<String>,
        timeout_ms: u64,
    ) -> Result<EventSourceEvent>;

    /// Send outbound data through a source that supports it.
    async fn send(&self, source: &str, data: Value) -> Result<()>;
}

/// Default timeout for `event.wait` when none is given.
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 60_000;

/// The `event` SDK client.
pub struct EventClient {
    bridge: Option<Arc<dyn EventBridge>>,
}

impl EventClient {
    /// A client with no bridge; every call fails with
    /// `UNSUPPORTED_CAPABILITY` until one is installed.
    pub fn disconnected() -> Self {
        Self { bridge: None }
    }

    /// A client backed by a live event-source manager.
    pub fn new(bridge: Arc<dyn EventBridge>) -> Self {
        Self {
            bridge: Some(bridge),
        }
    }

    fn bridge(&self) -> Result<&Arc<dyn EventBridge>> {
        self.bridge.as_ref().ok_or_else(|| {
            EngineError::unsupported("no event-source manager is attached to this engine")
        })
    }
}

#[async_trait]
impl ToolClient for EventClient {
    async fn call_action(&self, path: &str, inputs: Value) -> Result<Value> {
        let bridge = self.bridge()?;

        match path {
            "connect" => {
                let config: EventSourceConfig = serde_json::from_value(inputs).map_err(|e| {
                    EngineError::invalid_config(format!("invalid event source config: {e}"))
                })?;
                let id = config.id.clone();
                bridge.add_source(config).await?;
                Ok(json!({ "connected": true, "id": id }))
            }
            "wait" => {
                let source = inputs
                    .get("source")
                    .and_then(Value::as_str)
                    .map(String::from);
                let event_type = inputs
                    .get("type")
                    .and_then(Value::as_str)
                    .map(String::from);
                let timeout_ms = inputs
                    .get("timeout")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);

                let event = bridge.wait_for_event(source, event_type, timeout_ms).await?;
                serde_json::to_value(event).map_err(Into::into)
            }
            "send" => {
                let source = inputs
                    .get("source")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        EngineError::invalid_config("event.send requires input `source`")
                    })?;
                let data = inputs.get("data").cloned().unwrap_or(Value::Null);
                bridge.send(source, data).await?;
                Ok(json!({ "sent": true }))
            }
            "disconnect" => {
                let id = inputs.get("id").and_then(Value::as_str).ok_or_else(|| {
                    EngineError::invalid_config("event.disconnect requires input `id`")
                })?;
                bridge.remove_source(id).await?;
                Ok(json!({ "disconnected": true }))
            }
            other => Err(EngineError::invalid_config(format!(
                "event has no action `{other}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
