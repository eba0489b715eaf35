//! MCP tool client.
//!
//! Connects to an MCP server over HTTP JSON-RPC 2.0.  Every dotted action
//! path maps onto `tools/call { name, arguments }`, so a remote server's
//! tools appear as ordinary dotted actions.  Message ids increase
//! monotonically per connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flowdeck_core::{EngineError, Result, ToolClient};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// A [`ToolClient`] proxying dotted actions to an MCP server.
pub struct McpClient {
    service: String,
    endpoint: url::Url,
    headers: BTreeMap<String, String>,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl McpClient {
    /// Connect to an MCP server and perform the `initialize` handshake.
    pub async fn connect(
        service: impl Into<String>,
        endpoint: &str,
        auth: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let service = service.into();
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| EngineError::invalid_config(format!("invalid mcp_url: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::internal("failed to build http client").with_source(e))?;

        let client = Self {
            service: service.clone(),
            endpoint,
            headers: auth.clone(),
            http,
            next_id: AtomicU64::new(1),
        };

        let init = client
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "clientInfo": { "name": "flowdeck", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": {}
                }),
            )
            .await?;

        info!(
            service = %service,
            server = %init.get("serverInfo").and_then(|s| s.get("name")).and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "mcp session established"
        );

        Ok(client)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        debug!(service = %self.service, method, id, "mcp request");

        let mut request = self.http.post(self.endpoint.clone()).json(&body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            EngineError::network(format!("mcp request to `{}` failed: {e}", self.service))
                .with_source(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(
                status.as_u16(),
                format!("mcp server `{}` returned {status}", self.service),
            )
            .with_service(&self.service));
        }

        let parsed: JsonRpcResponse = response.json().await.map_err(|e| {
            EngineError::internal(format!("mcp server `{}` sent invalid JSON-RPC", self.service))
                .with_source(e)
        })?;

        if let Some(error) = parsed.error {
            return Err(EngineError::internal(format!(
                "mcp error {} from `{}`: {}",
                error.code, self.service, error.message
            ))
            .with_service(&self.service));
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ToolClient for McpClient {
    async fn call_action(&self, path: &str, inputs: Value) -> Result<Value> {
        self.request("tools/call", json!({ "name": path, "arguments": inputs }))
            .await
    }

    async fn close(&self) {
        // Best-effort shutdown notice; the transport is stateless HTTP.
        let _ = self.request("shutdown", json!({})).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
