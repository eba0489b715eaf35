//! WebSocket event source.
//!
//! Opens a connection to `options.url` and emits one event per inbound
//! frame.  Frames that decode as JSON objects keep their own `type` field
//! (defaulting to `message`); anything else is wrapped as
//! `{ type: "message", data: { message: <raw text> } }`.  Outbound
//! `send` is supported while the connection is open.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use flowdeck_core::workflow::EventSourceConfig;
use flowdeck_core::{EngineError, Result};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{EventEmitter, EventSource, SourceStatus};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket-backed event source.
pub struct WebSocketSource {
    id: String,
    url: String,
    status: Arc<StdMutex<SourceStatus>>,
    writer: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    token: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl WebSocketSource {
    /// Build from a source definition.  `options.url` must be a
    /// `ws://` or `wss://` endpoint.
    pub fn from_config(config: &EventSourceConfig) -> Result<Self> {
        let url = config
            .options
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::invalid_config(format!(
                    "websocket source `{}` needs `url` in options",
                    config.id
                ))
            })?;

        let parsed = url::Url::parse(url)
            .map_err(|e| EngineError::invalid_config(format!("invalid websocket url: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(EngineError::invalid_config(format!(
                "websocket url must use ws:// or wss://, got `{}`",
                parsed.scheme()
            )));
        }

        Ok(Self {
            id: config.id.clone(),
            url: url.to_string(),
            status: Arc::new(StdMutex::new(SourceStatus::Connecting)),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            token: CancellationToken::new(),
            handle: None,
        })
    }

    fn set_status(status: &Arc<StdMutex<SourceStatus>>, value: SourceStatus) {
        if let Ok(mut guard) = status.lock() {
            *guard = value;
        }
    }

    /// Decode one inbound text frame into `(event_type, data)`.
    fn decode_frame(text: &str) -> (String, Map<String, Value>) {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => {
                let event_type = map
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("message")
                    .to_string();
                (event_type, map)
            }
            _ => {
                let mut data = Map::new();
                data.insert("message".to_string(), json!(text));
                ("message".to_string(), data)
            }
        }
    }
}

#[async_trait]
impl EventSource for WebSocketSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&mut self, emitter: EventEmitter) -> Result<()> {
        let (stream, _response) = connect_async(&self.url).await.map_err(|e| {
            EngineError::network(format!("websocket connect to `{}` failed: {e}", self.url))
                .with_source(e)
        })?;

        info!(source = %self.id, url = %self.url, "websocket connected");
        let (write, mut read) = stream.split();
        *self.writer.lock().await = Some(write);
        Self::set_status(&self.status, SourceStatus::Connected);

        let id = self.id.clone();
        let status = Arc::clone(&self.status);
        let writer = Arc::clone(&self.writer);
        let token = self.token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = read.next() => frame,
                };

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let (event_type, data) = WebSocketSource::decode_frame(text.as_str());
                        debug!(source = %id, event_type = %event_type, "websocket frame");
                        emitter.emit(&event_type, data);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8_lossy(&bytes).to_string();
                        let (event_type, data) = WebSocketSource::decode_frame(&text);
                        emitter.emit(&event_type, data);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(source = %id, "websocket closed by peer");
                        let mut data = Map::new();
                        data.insert("reason".to_string(), json!("closed"));
                        emitter.emit("close", data);
                        WebSocketSource::set_status(&status, SourceStatus::Stopped);
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong frames
                    Some(Err(e)) => {
                        warn!(source = %id, error = %e, "websocket read error");
                        let mut data = Map::new();
                        data.insert("message".to_string(), json!(e.to_string()));
                        emitter.emit("error", data);
                        WebSocketSource::set_status(&status, SourceStatus::Error);
                        break;
                    }
                }
            }
            writer.lock().await.take();
        });

        self.handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) {
        self.token.cancel();
        if let Some(mut write) = self.writer.lock().await.take() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        Self::set_status(&self.status, SourceStatus::Stopped);
    }

    fn status(&self) -> SourceStatus {
        self.status
            .lock()
            .map(|guard| *guard)
            .unwrap_or(SourceStatus::Error)
    }

    async fn send(&self, data: Value) -> Result<()> {
        let text = match data {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let mut writer = self.writer.lock().await;
        let write = writer.as_mut().ok_or_else(|| {
            EngineError::network(format!("websocket `{}` is not connected", self.id))
        })?;

        write
            .send(Message::text(text))
            .await
            .map_err(|e| EngineError::network(format!("websocket send failed: {e}")).with_source(e))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config(url: &str) -> EventSourceConfig {
        serde_json::from_value(json!({
            "kind": "websocket",
            "id": "ws",
            "options": { "url": url }
        }))
        .unwrap()
    }

    #[test]
    fn rejects_non_ws_urls() {
        assert!(WebSocketSource::from_config(&config("https://example.com")).is_err());
        assert!(WebSocketSource::from_config(&config("not a url")).is_err());
    }

    #[test]
    fn frame_decoding() {
        let (event_type, data) =
            WebSocketSource::decode_frame(r#"{ "type": "deploy", "env": "prod" }"#);
        assert_eq!(event_type, "deploy");
        assert_eq!(data["env"], json!("prod"));

        let (event_type, data) = WebSocketSource::decode_frame("plain text");
        assert_eq!(event_type, "message");
        assert_eq!(data["message"], json!("plain text"));

        // A JSON array is not an object; it wraps like raw text.
        let (event_type, _) = WebSocketSource::decode_frame("[1, 2]");
        assert_eq!(event_type, "message");
    }

    /// Round-trip against a real in-process WebSocket server.
    #[tokio::test]
    async fn receives_and_sends_frames() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Server: accept one client, push one frame, echo the next inbound
        // frame back over a channel for the assertion.
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::text(r#"{ "type": "greeting", "n": 1 }"#.to_string()))
                .await
                .unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = inbound_tx.send(text.as_str().to_string());
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = WebSocketSource::from_config(&config(&format!("ws://{addr}"))).unwrap();
        source
            .connect(EventEmitter::new("ws", None, tx))
            .await
            .unwrap();
        assert_eq!(source.status(), SourceStatus::Connected);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame should arrive")
            .unwrap();
        assert_eq!(event.event_type, "greeting");
        assert_eq!(event.data["n"], json!(1));

        source.send(json!({ "reply": true })).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(2), inbound_rx.recv())
            .await
            .expect("server should receive the reply")
            .unwrap();
        assert!(echoed.contains("reply"));

        source.stop().await;
        assert_eq!(source.status(), SourceStatus::Stopped);
    }
}
