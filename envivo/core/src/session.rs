//! Stream Session Controller
//!
//! Owns the lifecycle of one connection to the filtered stream:
//!
//! ```text
//! Idle ──start──► Connecting ──connected──► Active ──end / error / stop──► Draining ──► Closed
//!                     │
//!                     └── connect error ──► Closed (reported by start, no task spawned)
//! ```
//!
//! A single producer task owns the response body. It frames, decodes, enriches
//! and dispatches records in arrival order. Only this task ever reads the
//! body, and it stops reading as soon as cancellation is observed.
//!
//! When the producer exits, for whatever reason, it closes the relay queue
//! from the producer side so an attached client receives everything already
//! queued before its socket closes.

use std::fmt;
use std::sync::Arc;

use tokio::io::AsyncBufRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::client::FeedClient;
use crate::dispatch::Dispatcher;
use crate::enrich::Enricher;
use crate::error::StreamError;
use crate::event::decode;
use crate::framer::{ChunkFramer, DEFAULT_MAX_FRAME_BYTES};

// ============================================================================
// Identity and state
// ============================================================================

/// Unique session identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new session id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not started
    Idle,
    /// Opening the stream
    Connecting,
    /// Reading and dispatching
    Active,
    /// Stopped reading; closing sinks
    Draining,
    /// Finished
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// The remote closed the body
    EndOfStream,
    /// Stopped on request
    Stopped,
    /// A transport or decode error ended the session
    Failed,
}

/// Counters for a finished session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session id
    pub id: SessionId,
    /// Why the session ended
    pub end_reason: EndReason,
    /// Frames read (keep-alives excluded)
    pub frames: u64,
    /// Keep-alive lines discarded
    pub keep_alives: u64,
    /// Events dropped by the language filter
    pub filtered: u64,
    /// Records handed to the dispatcher
    pub dispatched: u64,
}

impl SessionSummary {
    fn empty(id: SessionId, end_reason: EndReason) -> Self {
        Self {
            id,
            end_reason,
            frames: 0,
            keep_alives: 0,
            filtered: 0,
            dispatched: 0,
        }
    }
}

/// Result of a finished session
#[derive(Debug)]
pub struct SessionOutcome {
    /// Counters and end reason
    pub summary: SessionSummary,
    /// The error that ended the session, if any
    pub error: Option<StreamError>,
}

impl SessionOutcome {
    /// Convert into a `Result`, surfacing the terminating error
    ///
    /// # Errors
    ///
    /// The error that ended the session.
    pub fn into_result(self) -> Result<SessionSummary, StreamError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.summary),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A stream session, ready to start
pub struct StreamSession {
    id: SessionId,
    client: FeedClient,
    enricher: Enricher,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
    close_sinks_on_end: bool,
    state_tx: watch::Sender<SessionState>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Create an idle session
    #[must_use]
    pub fn new(client: FeedClient, enricher: Enricher, dispatcher: Arc<Dispatcher>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            id: SessionId::new(),
            client,
            enricher,
            dispatcher,
            cancel: CancellationToken::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            close_sinks_on_end: true,
            state_tx,
        }
    }

    /// Stop when `parent` is cancelled, in addition to [`SessionHandle::stop`]
    #[must_use]
    pub fn with_parent_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Override the maximum frame size
    #[must_use]
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Leave relay queues open when the session ends
    ///
    /// Used when another session will take over the same dispatcher; the
    /// caller is then responsible for [`Dispatcher::close_sinks`].
    #[must_use]
    pub fn keep_sinks_open(mut self) -> Self {
        self.close_sinks_on_end = false;
        self
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Connect and spawn the producer
    ///
    /// Returns as soon as the stream is open; records flow in the background.
    ///
    /// # Errors
    ///
    /// Connection failures are reported here, before any task is spawned.
    pub async fn start(self) -> Result<SessionHandle, StreamError> {
        self.state_tx.send_replace(SessionState::Connecting);
        info!(session = %self.id, url = %self.client.stream_url(), "Starting stream session");

        let connected = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = self.client.connect_stream() => Some(result),
        };

        match connected {
            Some(Ok(body)) => Ok(self.start_with_reader(body)),
            Some(Err(e)) => {
                self.state_tx.send_replace(SessionState::Closed);
                error!(session = %self.id, error = %e, "Failed to connect to stream");
                Err(e)
            }
            None => {
                // Cancelled while connecting: run the producer over nothing so
                // the caller still gets a handle with a Stopped outcome.
                Ok(self.start_with_reader(tokio::io::empty()))
            }
        }
    }

    /// Run the pipeline over an already-open body
    pub fn start_with_reader<R>(self, reader: R) -> SessionHandle
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let Self {
            id,
            enricher,
            dispatcher,
            cancel,
            max_frame_bytes,
            close_sinks_on_end,
            state_tx,
            ..
        } = self;

        state_tx.send_replace(SessionState::Active);
        let state_rx = state_tx.subscribe();

        let producer = Producer {
            id,
            enricher,
            dispatcher,
            cancel: cancel.clone(),
            close_sinks_on_end,
            state_tx,
        };
        let framer = ChunkFramer::with_max_frame_bytes(reader, max_frame_bytes);
        let task = tokio::spawn(
            producer
                .run(framer)
                .instrument(tracing::info_span!("session", %id)),
        );

        SessionHandle {
            id,
            cancel,
            state_rx,
            task,
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

struct Producer {
    id: SessionId,
    enricher: Enricher,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    close_sinks_on_end: bool,
    state_tx: watch::Sender<SessionState>,
}

impl Producer {
    async fn run<R>(self, mut framer: ChunkFramer<R>) -> SessionOutcome
    where
        R: AsyncBufRead + Unpin,
    {
        let mut filtered = 0_u64;
        let mut dispatched = 0_u64;

        let result: Result<EndReason, StreamError> = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                frame = framer.next_frame() => Some(frame),
            };

            let event = match next {
                None => break Ok(EndReason::Stopped),
                Some(Ok(None)) => break Ok(EndReason::EndOfStream),
                Some(Err(e)) => break Err(StreamError::Read(e)),
                Some(Ok(Some(frame))) => match decode(frame) {
                    Ok(event) => event,
                    Err(e) => break Err(e.into()),
                },
            };

            let record = match self.enricher.process(&event) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    filtered += 1;
                    debug!(id = %event.id, lang = ?event.lang, "Event filtered out");
                    continue;
                }
                Err(e) => break Err(e.into()),
            };

            self.dispatcher.dispatch(&record).await;
            dispatched += 1;
        };

        self.state_tx.send_replace(SessionState::Draining);
        if self.close_sinks_on_end {
            self.dispatcher.close_sinks();
        }

        let frames = framer.frames();
        let keep_alives = framer.keep_alives();
        // Releases the response body
        drop(framer);

        let (end_reason, error) = match result {
            Ok(reason) => (reason, None),
            Err(e) => (EndReason::Failed, Some(e)),
        };

        let summary = SessionSummary {
            id: self.id,
            end_reason,
            frames,
            keep_alives,
            filtered,
            dispatched,
        };

        match &error {
            None => info!(?end_reason, frames, dispatched, filtered, "Stream session ended"),
            Some(e) => warn!(error = %e, frames, dispatched, "Stream session failed"),
        }

        self.state_tx.send_replace(SessionState::Closed);
        SessionOutcome { summary, error }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Control handle for a running session
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    cancel: CancellationToken,
    state_rx: watch::Receiver<SessionState>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Token that stops this session when cancelled
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the session reaches `state` or closes
    pub async fn wait_for_state(&mut self, state: SessionState) -> SessionState {
        match self
            .state_rx
            .wait_for(|s| *s == state || *s == SessionState::Closed)
            .await
        {
            Ok(s) => *s,
            Err(_) => SessionState::Closed,
        }
    }

    /// Stop the session and wait for the producer to release the stream
    ///
    /// Stopping a session that already ended just returns its outcome.
    pub async fn stop(self) -> SessionOutcome {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for the session to end on its own
    pub async fn wait(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => SessionOutcome {
                summary: SessionSummary::empty(self.id, EndReason::Failed),
                error: Some(StreamError::Task(e.to_string())),
            },
        }
    }
}
