//! Long-lived event sources for Flowdeck.
//!
//! Daemon-mode workflows block on `event.wait` until one of their sources
//! produces a matching event.  Three source kinds are provided:
//!
//! - [`websocket::WebSocketSource`] — a bidirectional connection; every
//!   inbound frame becomes an event.
//! - [`cron::CronSource`] — fires `tick` events on an interval
//!   (`"100ms"`, `"1h"`) or a cron expression.
//! - [`rss::RssSource`] — polls an RSS 2.0/Atom feed; the first poll
//!   seeds the seen set, later polls emit `new_item` events.
//!
//! The [`manager::EventSourceManager`] owns the sources, fans their
//! events into one queue, and implements the registry's
//! [`flowdeck_registry::EventBridge`] so `event.*` actions reach it.

pub mod cron;
pub mod manager;
pub mod rss;
pub mod source;
pub mod websocket;

pub use manager::{EventSourceManager, SourceStat};
pub use source::{EventEmitter, EventSource, SourceStatus};
