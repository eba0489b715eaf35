//! Event source manager.
//!
//! Owns every live source, fans their events into one queue, and serves
//! `wait_for_event` rendezvous.  Events that arrive while nobody is
//! waiting (or that match nobody's filter) are buffered FIFO per arrival
//! order, so `wait_for_event` always returns the oldest matching event.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use flowdeck_core::workflow::{EventSourceConfig, EventSourceEvent, EventSourceKind};
use flowdeck_core::{EngineError, Result};
use flowdeck_registry::EventBridge;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cron::CronSource;
use crate::rss::RssSource;
use crate::source::{EventEmitter, EventSource, SourceStatus};
use crate::websocket::WebSocketSource;

/// Cap on buffered events nobody has claimed yet; the oldest are dropped
/// past this point.
const MAX_BUFFERED_EVENTS: usize = 1_024;

/// Poll slice while waiting for events, so concurrent waiters interleave.
const WAIT_POLL_SLICE: Duration = Duration::from_millis(25);

struct SourceEntry {
    kind: EventSourceKind,
    source: Box<dyn EventSource>,
}

/// A source's id, kind, and lifecycle status, for `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStat {
    /// Source id.
    pub id: String,
    /// Source kind.
    pub kind: EventSourceKind,
    /// Current status.
    pub status: SourceStatus,
}

/// Owns the long-lived sources of one engine.
pub struct EventSourceManager {
    sources: Mutex<HashMap<String, SourceEntry>>,
    events_tx: mpsc::UnboundedSender<EventSourceEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<EventSourceEvent>>,
    buffer: std::sync::Mutex<VecDeque<EventSourceEvent>>,
    shutdown: CancellationToken,
}

impl EventSourceManager {
    /// Create a manager with no sources.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            sources: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(events_rx),
            buffer: std::sync::Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register and connect a source.
    ///
    /// # Errors
    ///
    /// `PROVIDER_CONFLICT` for a duplicate id; whatever the source's
    /// `connect` raises otherwise.
    pub async fn add(&self, config: EventSourceConfig) -> Result<()> {
        let mut sources = self.sources.lock().await;
        if sources.contains_key(&config.id) {
            return Err(EngineError::provider_conflict(format!(
                "event source `{}` already exists",
                config.id
            )));
        }

        let mut source: Box<dyn EventSource> = match config.kind {
            EventSourceKind::Websocket => Box::new(WebSocketSource::from_config(&config)?),
            EventSourceKind::Cron => Box::new(CronSource::from_config(&config)?),
            EventSourceKind::Rss => Box::new(RssSource::from_config(&config)?),
        };

        let emitter = EventEmitter::new(
            config.id.clone(),
            config.filter.clone(),
            self.events_tx.clone(),
        );
        source.connect(emitter).await?;

        info!(source = %config.id, kind = ?config.kind, "event source added");
        sources.insert(
            config.id.clone(),
            SourceEntry {
                kind: config.kind,
                source,
            },
        );
        Ok(())
    }

    /// Stop and deregister a source.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut sources = self.sources.lock().await;
        let mut entry = sources.remove(id).ok_or_else(|| {
            EngineError::provider_not_found(format!("event source `{id}` does not exist"))
        })?;
        entry.source.stop().await;
        info!(source = %id, "event source removed");
        Ok(())
    }

    /// Stop every source and reject pending waiters.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        let mut sources = self.sources.lock().await;
        for (id, mut entry) in sources.drain() {
            entry.source.stop().await;
            debug!(source = %id, "event source stopped");
        }
        info!("all event sources stopped");
    }

    /// Current sources and their statuses.
    pub async fn stats(&self) -> Vec<SourceStat> {
        let sources = self.sources.lock().await;
        let mut stats: Vec<SourceStat> = sources
            .iter()
            .map(|(id, entry)| SourceStat {
                id: id.clone(),
                kind: entry.kind,
                status: entry.source.status(),
            })
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    /// Return the oldest event matching the filters, waiting up to
    /// `timeout_ms` for one to arrive.
    ///
    /// # Errors
    ///
    /// `TIMEOUT` when no matching event arrives in time; an internal
    /// error when the manager is shut down while waiting.
    pub async fn wait_for_event(
        &self,
        source: Option<&str>,
        event_type: Option<&str>,
        timeout_ms: u64,
    ) -> Result<EventSourceEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if self.shutdown.is_cancelled() {
                return Err(EngineError::internal(
                    "event source manager was stopped while waiting",
                ));
            }

            if let Some(event) = self.take_buffered(source, event_type) {
                return Ok(event);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(EngineError::timeout(format!(
                    "no matching event within {timeout_ms}ms"
                )));
            }

            // Only one waiter can hold the receiver; everyone else polls
            // the shared buffer on a short slice.
            let slice = WAIT_POLL_SLICE.min(deadline - now);
            let Ok(mut rx) = self.events_rx.try_lock() else {
                tokio::time::sleep(slice).await;
                continue;
            };

            match tokio::time::timeout(slice, rx.recv()).await {
                Ok(Some(event)) => {
                    drop(rx);
                    if event_matches(&event, source, event_type) {
                        return Ok(event);
                    }
                    self.push_buffered(event);
                }
                Ok(None) => {
                    return Err(EngineError::internal("event channel closed"));
                }
                Err(_) => {} // slice elapsed; loop to re-check buffer/deadline
            }
        }
    }

    fn take_buffered(&self, source: Option<&str>, event_type: Option<&str>) -> Option<EventSourceEvent> {
        let mut buffer = self.buffer.lock().ok()?;
        let index = buffer
            .iter()
            .position(|event| event_matches(event, source, event_type))?;
        buffer.remove(index)
    }

    fn push_buffered(&self, event: EventSourceEvent) {
        if let Ok(mut buffer) = self.buffer.lock() {
            if buffer.len() >= MAX_BUFFERED_EVENTS {
                buffer.pop_front();
            }
            buffer.push_back(event);
        }
    }
}

fn event_matches(event: &EventSourceEvent, source: Option<&str>, event_type: Option<&str>) -> bool {
    if let Some(source) = source
        && event.source != source
    {
        return false;
    }
    if let Some(event_type) = event_type
        && event.event_type != event_type
    {
        return false;
    }
    true
}

impl Default for EventSourceManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Registry bridge
// ---------------------------------------------------------------------------

#[async_trait]
impl EventBridge for EventSourceManager {
    async fn add_source(&self, config: EventSourceConfig) -> Result<()> {
        self.add(config).await
    }

    async fn remove_source(&self, id: &str) -> Result<()> {
        self.remove(id).await
    }

    async fn wait_for_event(
        &self,
        source: Option<String>,
        event_type: Option<String>,
        timeout_ms: u64,
    ) -> Result<EventSourceEvent> {
        EventSourceManager::wait_for_event(self, source.as_deref(), event_type.as_deref(), timeout_ms)
            .await
    }

    async fn send(&self, source: &str, data: Value) -> Result<()> {
        let sources = self.sources.lock().await;
        let entry = sources.get(source).ok_or_else(|| {
            EngineError::provider_not_found(format!("event source `{source}` does not exist"))
        })?;
        entry.source.send(data).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
