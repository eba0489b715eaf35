//! Interval / cron tick source.
//!
//! Fires a `tick` event on a fixed interval (`"100ms"`, `"30s"`, `"1h"`)
//! or on a cron expression (`"0 9 * * 1-5"`).  Standard 5-field cron
//! input is normalized by prepending a seconds field.  The optional
//! `immediate` flag fires one tick as soon as the source connects.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flowdeck_core::workflow::EventSourceConfig;
use flowdeck_core::{EngineError, Result};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::source::{EventEmitter, EventSource, SourceStatus};

/// What drives the tick cadence.
#[derive(Debug, Clone)]
enum Schedule {
    Interval(Duration),
    Cron(cron::Schedule),
}

/// Parse an interval spec like `100ms`, `30s`, `5m`, `1h`, `2d`.
pub fn parse_interval(spec: &str) -> Result<Duration> {
    let spec = spec.trim();
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| EngineError::invalid_config(format!("interval `{spec}` has no unit")))?;
    let (number, unit) = spec.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| EngineError::invalid_config(format!("invalid interval `{spec}`")))?;

    let millis = match unit {
        "ms" => number,
        "s" => number * 1_000,
        "m" => number * 60_000,
        "h" => number * 3_600_000,
        "d" => number * 86_400_000,
        other => {
            return Err(EngineError::invalid_config(format!(
                "unknown interval unit `{other}` in `{spec}`"
            )));
        }
    };
    if millis == 0 {
        return Err(EngineError::invalid_config("interval must be positive"));
    }
    Ok(Duration::from_millis(millis))
}

/// Normalize a cron expression to the 6/7-field format the `cron` crate
/// expects, prepending a `0` seconds field to 5-field user input.
fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| EngineError::invalid_config(format!("invalid cron expression `{expr}`: {e}")))
}

/// Ticker event source.
pub struct CronSource {
    id: String,
    schedule: Schedule,
    immediate: bool,
    status: SourceStatus,
    token: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl CronSource {
    /// Build from a source definition.  Exactly one of `options.interval`
    /// or `options.cron` must be present.
    pub fn from_config(config: &EventSourceConfig) -> Result<Self> {
        let interval = config.options.get("interval").and_then(Value::as_str);
        let cron_expr = config.options.get("cron").and_then(Value::as_str);

        let schedule = match (interval, cron_expr) {
            (Some(interval), None) => Schedule::Interval(parse_interval(interval)?),
            (None, Some(expr)) => Schedule::Cron(parse_cron(expr)?),
            (Some(_), Some(_)) => {
                return Err(EngineError::invalid_config(format!(
                    "cron source `{}` sets both `interval` and `cron`",
                    config.id
                )));
            }
            (None, None) => {
                return Err(EngineError::invalid_config(format!(
                    "cron source `{}` needs `interval` or `cron` in options",
                    config.id
                )));
            }
        };

        Ok(Self {
            id: config.id.clone(),
            schedule,
            immediate: config
                .options
                .get("immediate")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            status: SourceStatus::Connecting,
            token: CancellationToken::new(),
            handle: None,
        })
    }

    fn tick_data() -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("fired_at".to_string(), json!(Utc::now().to_rfc3339()));
        data
    }

    /// Time until the next tick.
    fn delay(schedule: &Schedule) -> Duration {
        match schedule {
            Schedule::Interval(interval) => *interval,
            Schedule::Cron(schedule) => schedule
                .upcoming(Utc)
                .next()
                .and_then(|next| (next - Utc::now()).to_std().ok())
                .unwrap_or(Duration::from_secs(60)),
        }
    }
}

#[async_trait]
impl EventSource for CronSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&mut self, emitter: EventEmitter) -> Result<()> {
        let schedule = self.schedule.clone();
        let immediate = self.immediate;
        let token = self.token.clone();
        let id = self.id.clone();

        let handle = tokio::spawn(async move {
            info!(source = %id, "cron source started");

            if immediate {
                emitter.emit("tick", CronSource::tick_data());
            }

            loop {
                let delay = CronSource::delay(&schedule);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        debug!(source = %id, "tick");
                        emitter.emit("tick", CronSource::tick_data());
                    }
                }
            }

            info!(source = %id, "cron source stopped");
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
