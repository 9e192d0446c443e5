//! Sinks
//!
//! Consumers of [`EnrichedRecord`]s.
//!
//! # Sections
//!
//! - [`Sink`] trait
//! - [`TerminalSink`]: synchronous, human-readable printing
//! - [`WebsocketSink`]: serializes and enqueues into a relay queue

use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossterm::style::Stylize;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::enrich::EnrichedRecord;
use crate::relay::queue::{PushOutcome, QueueStats, RelayQueue};

// ============================================================================
// Trait
// ============================================================================

/// Errors from a single delivery
#[derive(Debug, Error)]
pub enum SinkError {
    /// Writing to the underlying output failed
    #[error("sink write failed: {0}")]
    Io(#[from] io::Error),

    /// The record could not be serialized
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The consumer behind this sink is gone
    #[error("sink is closed")]
    Closed,
}

/// A consumer of enriched records
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Deliver one record
    ///
    /// # Errors
    ///
    /// [`SinkError`] if the record could not be delivered. Callers log and
    /// continue; a failed delivery never stops the producer.
    async fn deliver(&self, record: &EnrichedRecord) -> Result<(), SinkError>;
}

// ============================================================================
// Terminal
// ============================================================================

/// How the terminal sink renders records
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalStyle {
    /// Colored, multi-line
    #[default]
    Color,
    /// Multi-line without escape codes
    Plain,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for TerminalStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "color" | "colour" => Ok(Self::Color),
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(format!("expected color, plain or json, got {other:?}")),
        }
    }
}

/// Prints records to a writer (stdout by default)
pub struct TerminalSink {
    out: Mutex<Box<dyn Write + Send>>,
    style: TerminalStyle,
}

impl std::fmt::Debug for TerminalSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSink")
            .field("style", &self.style)
            .finish_non_exhaustive()
    }
}

impl TerminalSink {
    /// Print to an arbitrary writer
    #[must_use]
    pub fn new(out: Box<dyn Write + Send>, style: TerminalStyle) -> Self {
        Self {
            out: Mutex::new(out),
            style,
        }
    }

    /// Print to stdout
    #[must_use]
    pub fn stdout(style: TerminalStyle) -> Self {
        Self::new(Box::new(io::stdout()), style)
    }

    /// Rendering style
    #[must_use]
    pub fn style(&self) -> TerminalStyle {
        self.style
    }

    fn render(&self, record: &EnrichedRecord) -> Result<String, SinkError> {
        let when = display_timestamp(&record.created_at);
        let rendered = match self.style {
            TerminalStyle::Json => serde_json::to_string(record)?,
            TerminalStyle::Plain => format!(
                "@{} - {}  {}\n{}\n{}\n",
                record.author_username, record.author_name, when, record.text, record.tweet_url
            ),
            TerminalStyle::Color => format!(
                "{} - {}  {}\n{}\n{}\n",
                format!("@{}", record.author_username).blue().bold(),
                record.author_name.as_str().cyan(),
                when.dark_grey(),
                record.text.as_str().white(),
                record.tweet_url.as_str().green().underlined()
            ),
        };
        Ok(rendered)
    }
}

/// Render an RFC 3339 timestamp for display, falling back to the raw value
fn display_timestamp(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw).map_or_else(
        |_| raw.to_string(),
        |ts| {
            ts.with_timezone(&Utc)
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string()
        },
    )
}

#[async_trait]
impl Sink for TerminalSink {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn deliver(&self, record: &EnrichedRecord) -> Result<(), SinkError> {
        let rendered = self.render(record)?;
        let mut out = self.out.lock();
        writeln!(out, "{rendered}")?;
        out.flush()?;
        Ok(())
    }
}

// ============================================================================
// Websocket
// ============================================================================

/// Producer side of a websocket relay
///
/// Each delivery serializes its own copy of the record and pushes it into the
/// relay queue; the connection task owns the socket.
#[derive(Clone, Debug)]
pub struct WebsocketSink {
    id: Uuid,
    queue: Arc<RelayQueue>,
}

impl WebsocketSink {
    /// Wrap a relay queue
    #[must_use]
    pub fn new(id: Uuid, queue: Arc<RelayQueue>) -> Self {
        Self { id, queue }
    }

    /// Relay id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the relay behind this sink has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Queue counters
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Serialize and enqueue a record
    ///
    /// # Errors
    ///
    /// [`SinkError::Closed`] if the relay queue is closed,
    /// [`SinkError::Serialize`] if the record cannot be encoded.
    pub async fn enqueue(&self, record: &EnrichedRecord) -> Result<PushOutcome, SinkError> {
        let payload = serde_json::to_string(record)?;
        self.queue.push(payload).await.map_err(|_| SinkError::Closed)
    }

    /// End of stream from the producer side; queued records still drain
    pub fn close(&self) -> bool {
        self.queue.close()
    }
}

#[async_trait]
impl Sink for WebsocketSink {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn deliver(&self, record: &EnrichedRecord) -> Result<(), SinkError> {
        self.enqueue(record).await.map(|_| ())
    }
}
