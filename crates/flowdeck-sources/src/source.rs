//! Event source trait and emitter.

use async_trait::async_trait;
use chrono::Utc;
use flowdeck_core::workflow::EventSourceEvent;
use flowdeck_core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::trace;

/// Lifecycle status of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// `connect` has been called but the source is not yet live.
    Connecting,
    /// The source is live and may emit events.
    Connected,
    /// The source was stopped and will emit nothing further.
    Stopped,
    /// The source hit a fatal error.
    Error,
}

/// A long-lived producer of events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// The source's unique id.
    fn id(&self) -> &str;

    /// Start producing events through the emitter.
    async fn connect(&mut self, emitter: EventEmitter) -> Result<()>;

    /// Stop the source and release underlying resources.
    async fn stop(&mut self);

    /// Current lifecycle status.
    fn status(&self) -> SourceStatus;

    /// Send outbound data, for sources that support it.
    async fn send(&self, _data: Value) -> Result<()> {
        Err(EngineError::unsupported(format!(
            "source `{}` does not support outbound send",
            self.id()
        )))
    }
}

/// Hands events from a source into the manager's queue, applying the
/// source's event-type filter before emission.
#[derive(Clone)]
pub struct EventEmitter {
    source_id: String,
    /// Event-type substrings to keep; `None` keeps everything.
    filter: Option<Vec<String>>,
    tx: mpsc::UnboundedSender<EventSourceEvent>,
}

impl EventEmitter {
    /// Create an emitter for the named source.
    pub fn new(
        source_id: impl Into<String>,
        filter: Option<Vec<String>>,
        tx: mpsc::UnboundedSender<EventSourceEvent>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            filter,
            tx,
        }
    }

    /// Emit an event, unless the filter drops it.  Send failures mean the
    /// manager is gone; they are ignored.
    pub fn emit(&self, event_type: &str, data: Map<String, Value>) {
        if let Some(filter) = &self.filter
            && !filter.iter().any(|needle| event_type.contains(needle))
        {
            trace!(
                source = %self.source_id,
                event_type,
                "event dropped by source filter"
            );
            return;
        }

        let event = EventSourceEvent {
            source: self.source_id.clone(),
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        };
        let _ = self.tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn emitter_applies_type_filter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new("src", Some(vec!["item".to_string()]), tx);

        emitter.emit("tick", Map::new());
        emitter.emit("new_item", Map::new());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "new_item");
        assert!(rx.try_recv().is_err(), "tick must have been filtered out");
    }

    #[tokio::test]
    async fn emitter_without_filter_passes_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new("src", None, tx);

        let mut data = Map::new();
        data.insert("n".to_string(), json!(1));
        emitter.emit("anything", data);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "src");
        assert_eq!(event.data["n"], json!(1));
    }
}
