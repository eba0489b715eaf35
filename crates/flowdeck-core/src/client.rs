//! The tool client seam.
//!
//! Every connector — built-in SDKs, HTTP-backed integrations, MCP servers —
//! exposes exactly one dispatch surface: [`ToolClient::call_action`].  The
//! registry routes dotted action paths here, and the reliability layer
//! decorates this single function with validation, timeouts, retries, and
//! throttling.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A connector to an external service (or a built-in capability).
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Invoke the action at `path` (the dotted part after the SDK name,
    /// e.g. `chat.postMessage`) with a single map of resolved inputs.
    async fn call_action(&self, path: &str, inputs: Value) -> Result<Value>;

    /// Release any underlying resources.  Default is a no-op.
    async fn close(&self) {}
}
