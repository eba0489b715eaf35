//! RSS/Atom polling source.
//!
//! Polls a feed URL on an interval.  The first successful poll *seeds*
//! the set of seen item ids and emits nothing; later polls emit a
//! `new_item` event for every unseen item, up to `max_items` per poll.
//! Items are identified by `guid`, then `id`, then `link`.  Fetch and
//! parse failures emit an `error` event and the poller keeps going.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use flowdeck_core::workflow::EventSourceConfig;
use flowdeck_core::{EngineError, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cron::parse_interval;
use crate::source::{EventEmitter, EventSource, SourceStatus};

/// One item parsed out of a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    /// Stable identity: `guid`, `id`, or `link`, in that order.
    pub id: String,
    /// Item title, when present.
    pub title: Option<String>,
    /// Item link, when present.
    pub link: Option<String>,
}

// ---------------------------------------------------------------------------
// Feed parsing
// ---------------------------------------------------------------------------

/// Parse an RSS 2.0 or Atom document into its items.
///
/// Items without any usable identity (`guid`/`id`/`link`) are dropped.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut in_item = false;
    let mut capture: Option<String> = None;
    let mut guid: Option<String> = None;
    let mut atom_id: Option<String> = None;
    let mut link: Option<String> = None;
    let mut title: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "item" | "entry" => {
                        in_item = true;
                        guid = None;
                        atom_id = None;
                        link = None;
                        title = None;
                    }
                    "guid" | "id" | "link" | "title" if in_item => {
                        capture = Some(name);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                // Atom links are empty elements carrying an `href`.
                if in_item && e.local_name().as_ref() == b"link" {
                    if let Ok(Some(href)) = e.try_get_attribute("href") {
                        if let Ok(href) = href.unescape_value() {
                            link.get_or_insert_with(|| href.to_string());
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(field) = &capture {
                    let text = t
                        .unescape()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).to_string());
                    assign_field(field, text, &mut guid, &mut atom_id, &mut link, &mut title);
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(field) = &capture {
                    let text = String::from_utf8_lossy(t.as_ref()).to_string();
                    assign_field(field, text, &mut guid, &mut atom_id, &mut link, &mut title);
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "item" | "entry" => {
                        in_item = false;
                        let identity = guid
                            .take()
                            .or_else(|| atom_id.take())
                            .or_else(|| link.clone());
                        if let Some(id) = identity {
                            items.push(FeedItem {
                                id,
                                title: title.take(),
                                link: link.take(),
                            });
                        }
                    }
                    _ => capture = None,
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::internal(format!("feed parse error: {e}")));
            }
            _ => {}
        }
    }

    Ok(items)
}

fn assign_field(
    field: &str,
    text: String,
    guid: &mut Option<String>,
    atom_id: &mut Option<String>,
    link: &mut Option<String>,
    title: &mut Option<String>,
) {
    match field {
        "guid" => *guid = Some(text),
        "id" => *atom_id = Some(text),
        "link" => *link = Some(text),
        "title" => *title = Some(text),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Seeding / dedup
// ---------------------------------------------------------------------------

/// Tracks which item ids have been seen across polls.
#[derive(Debug, Default)]
pub struct FeedCursor {
    seen: HashSet<String>,
    seeded: bool,
    max_items: usize,
}

impl FeedCursor {
    /// Create a cursor emitting at most `max_items` new items per poll.
    pub fn new(max_items: usize) -> Self {
        Self {
            seen: HashSet::new(),
            seeded: false,
            max_items,
        }
    }

    /// Observe one poll's items.  The first call seeds the seen set and
    /// returns nothing; later calls return unseen items (capped), oldest
    /// feed position first.
    pub fn observe(&mut self, items: Vec<FeedItem>) -> Vec<FeedItem> {
        if !self.seeded {
            self.seeded = true;
            for item in items {
                self.seen.insert(item.id);
            }
            return Vec::new();
        }

        let mut fresh = Vec::new();
        for item in items {
            if fresh.len() >= self.max_items {
                break;
            }
            if self.seen.insert(item.id.clone()) {
                fresh.push(item);
            }
        }
        fresh
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Feed-polling event source.
pub struct RssSource {
    id: String,
    url: String,
    interval: Duration,
    max_items: usize,
    status: SourceStatus,
    token: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl RssSource {
    /// Build from a source definition.  `options.url` is required;
    /// `options.interval` defaults to five minutes, `options.max_items`
    /// to ten.
    pub fn from_config(config: &EventSourceConfig) -> Result<Self> {
        let url = config
            .options
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::invalid_config(format!(
                    "rss source `{}` needs `url` in options",
                    config.id
                ))
            })?;
        url::Url::parse(url)
            .map_err(|e| EngineError::invalid_config(format!("invalid feed url: {e}")))?;

        let interval = match config.options.get("interval").and_then(Value::as_str) {
            Some(spec) => parse_interval(spec)?,
            None => Duration::from_secs(300),
        };
        let max_items = config
            .options
            .get("max_items")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;

        Ok(Self {
            id: config.id.clone(),
            url: url.to_string(),
            interval,
            max_items,
            status: SourceStatus::Connecting,
            token: CancellationToken::new(),
            handle: None,
        })
    }

    async fn poll_once(
        http: &reqwest::Client,
        url: &str,
        cursor: &mut FeedCursor,
        emitter: &EventEmitter,
    ) {
        let body = match http.get(url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    emit_error(emitter, format!("failed to read feed body: {e}"));
                    return;
                }
            },
            Ok(response) => {
                emit_error(emitter, format!("feed returned {}", response.status()));
                return;
            }
            Err(e) => {
                emit_error(emitter, format!("feed fetch failed: {e}"));
                return;
            }
        };

        let items = match parse_feed(&body) {
            Ok(items) => items,
            Err(e) => {
                emit_error(emitter, e.to_string());
                return;
            }
        };

        for item in cursor.observe(items) {
            debug!(item = %item.id, "new feed item");
            let mut data = Map::new();
            data.insert("guid".to_string(), json!(item.id));
            data.insert("title".to_string(), json!(item.title));
            data.insert("link".to_string(), json!(item.link));
            emitter.emit("new_item", data);
        }
    }
}

fn emit_error(emitter: &EventEmitter, message: String) {
    warn!(error = %message, "rss poll failed");
    let mut data = Map::new();
    data.insert("message".to_string(), json!(message));
    emitter.emit("error", data);
}

#[async_trait]
impl EventSource for RssSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&mut self, emitter: EventEmitter) -> Result<()> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::internal("failed to build http client").with_source(e))?;

        let id = self.id.clone();
        let url = self.url.clone();
        let interval = self.interval;
        let token = self.token.clone();
        let mut cursor = FeedCursor::new(self.max_items);

        let handle = tokio::spawn(async move {
            info!(source = %id, url = %url, "rss source started");

            // Seed immediately so the first interval's events are real.
            RssSource::poll_once(&http, &url, &mut cursor, &emitter).await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        RssSource::poll_once(&http, &url, &mut cursor, &emitter).await;
                    }
                }
            }

            info!(source = %id, "rss source stopped");
        });

        self.handle = Some(handle);
        self.status = SourceStatus::Connected;
        Ok(())
    }

    async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.status = SourceStatus::Stopped;
    }

    fn status(&self) -> SourceStatus {
        self.status
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <item>
      <title>First post</title>
      <link>https://example.com/a</link>
      <guid>a</guid>
    </item>
    <item>
      <title>Second post</title>
      <link>https://example.com/b</link>
      <guid>b</guid>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example feed</title>
  <entry>
    <title>Entry one</title>
    <id>urn:example:1</id>
    <link href="https://example.com/1"/>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a");
        assert_eq!(items[0].title.as_deref(), Some("First post"));
        assert_eq!(items[1].link.as_deref(), Some("https://example.com/b"));
    }

    #[test]
    fn parses_atom_entries() {
        let items = parse_feed(ATOM).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "urn:example:1");
        assert_eq!(items[0].link.as_deref(), Some("https://example.com/1"));
    }

    #[test]
    fn item_without_identity_is_dropped() {
        let xml = r#"<rss><channel><item><title>anon</title></item></channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn link_is_identity_fallback() {
        let xml = r#"<rss><channel><item><link>https://example.com/x</link></item></channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert_eq!(items[0].id, "https://example.com/x");
    }

    /// S7 — the first poll seeds, the second emits only the new item.
    #[test]
    fn cursor_seeds_then_emits_only_new_items() {
        let mut cursor = FeedCursor::new(10);

        let first = cursor.observe(vec![
            FeedItem { id: "a".into(), title: None, link: None },
            FeedItem { id: "b".into(), title: None, link: None },
        ]);
        assert!(first.is_empty(), "seeding poll must emit nothing");

        let second = cursor.observe(vec![
            FeedItem { id: "a".into(), title: None, link: None },
            FeedItem { id: "b".into(), title: None, link: None },
            FeedItem { id: "c".into(), title: None, link: None },
        ]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "c");

        // Already-emitted items stay seen.
        let third = cursor.observe(vec![FeedItem { id: "c".into(), title: None, link: None }]);
        assert!(third.is_empty());
    }

    #[test]
    fn cursor_caps_items_per_poll() {
        let mut cursor = FeedCursor::new(2);
        cursor.observe(Vec::new());

        let burst = cursor.observe(vec![
            FeedItem { id: "1".into(), title: None, link: None },
            FeedItem { id: "2".into(), title: None, link: None },
            FeedItem { id: "3".into(), title: None, link: None },
        ]);
        assert_eq!(burst.len(), 2);
    }

    #[test]
    fn config_requires_valid_url() {
        let config: EventSourceConfig = serde_json::from_value(json!({
            "kind": "rss", "id": "feed", "options": { "url": "not a url" }
        }))
        .unwrap();
        assert!(RssSource::from_config(&config).is_err());

        let config: EventSourceConfig = serde_json::from_value(json!({
            "kind": "rss", "id": "feed", "options": {}
        }))
        .unwrap();
        assert!(RssSource::from_config(&config).is_err());
    }
}
