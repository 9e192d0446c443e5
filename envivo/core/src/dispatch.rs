//! Fan-out Dispatcher
//!
//! Delivers every enriched record to the terminal sink and, when a relay is
//! attached, to the websocket sink. Records reach all sinks in dispatch order.
//!
//! The websocket slot is shared between the producer (dispatching) and the
//! relay server (attaching). The slot lock is never held across an await: the
//! sink handle is cloned out and the lock released before enqueueing.
//!
//! # Sections
//!
//! - Reports and stats
//! - [`Dispatcher`]

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::enrich::EnrichedRecord;
use crate::relay::queue::PushOutcome;
use crate::relay::state::RelaySlot;
use crate::sink::{Sink, SinkError, WebsocketSink};

// ============================================================================
// Reports and stats
// ============================================================================

/// What happened on the websocket path for one record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebsocketDelivery {
    /// No relay attached
    NotAttached,
    /// Pushed into the relay queue
    Queued(PushOutcome),
    /// The relay had gone away; it has been detached
    Detached,
    /// The record could not be handed to the relay
    Failed,
}

/// Per-record delivery report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchReport {
    /// Whether the terminal sink accepted the record
    pub terminal_ok: bool,
    /// Websocket outcome
    pub websocket: WebsocketDelivery,
}

/// Counters across the dispatcher's lifetime
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records dispatched
    pub dispatched: u64,
    /// Terminal deliveries that failed
    pub terminal_failures: u64,
    /// Records pushed to a relay queue
    pub websocket_enqueued: u64,
    /// Records lost to relay queue overflow
    pub websocket_dropped: u64,
}

/// Reasons a relay cannot be attached
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AttachError {
    /// A live relay is already attached
    #[error("relay {existing} is already attached")]
    AlreadyAttached {
        /// Id of the attached relay
        existing: Uuid,
    },
    /// The session feeding this dispatcher has ended
    #[error("stream has ended; no further relays can attach")]
    Closed,
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Debug, Default)]
struct SlotInner {
    sink: Option<WebsocketSink>,
    closed: bool,
}

/// Fans records out to the terminal and an optional websocket relay
pub struct Dispatcher {
    terminal: Box<dyn Sink>,
    relay: Mutex<SlotInner>,
    dispatched: AtomicU64,
    terminal_failures: AtomicU64,
    websocket_enqueued: AtomicU64,
    websocket_dropped: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("terminal", &self.terminal.name())
            .field("relay", &*self.relay.lock())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher with the given terminal sink and no relay
    #[must_use]
    pub fn new(terminal: Box<dyn Sink>) -> Self {
        Self {
            terminal,
            relay: Mutex::new(SlotInner::default()),
            dispatched: AtomicU64::new(0),
            terminal_failures: AtomicU64::new(0),
            websocket_enqueued: AtomicU64::new(0),
            websocket_dropped: AtomicU64::new(0),
        }
    }

    /// Deliver a record to every sink
    ///
    /// Terminal first, then the websocket relay if one is attached. Sink
    /// failures are logged and reported, never returned as errors.
    pub async fn dispatch(&self, record: &EnrichedRecord) -> DispatchReport {
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let terminal_ok = match self.terminal.deliver(record).await {
            Ok(()) => true,
            Err(e) => {
                self.terminal_failures.fetch_add(1, Ordering::Relaxed);
                warn!(sink = self.terminal.name(), id = %record.id, error = %e, "Terminal delivery failed");
                false
            }
        };

        let relay = self.relay.lock().sink.clone();
        let websocket = match relay {
            None => WebsocketDelivery::NotAttached,
            Some(sink) => match sink.enqueue(record).await {
                Ok(outcome) => {
                    if outcome != PushOutcome::DroppedNew {
                        self.websocket_enqueued.fetch_add(1, Ordering::Relaxed);
                    }
                    if outcome != PushOutcome::Enqueued {
                        self.websocket_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(relay = %sink.id(), ?outcome, "Relay queue full");
                    }
                    WebsocketDelivery::Queued(outcome)
                }
                Err(SinkError::Closed) => {
                    self.detach_if(sink.id());
                    WebsocketDelivery::Detached
                }
                Err(e) => {
                    warn!(relay = %sink.id(), error = %e, "Websocket delivery failed");
                    WebsocketDelivery::Failed
                }
            },
        };

        DispatchReport {
            terminal_ok,
            websocket,
        }
    }

    /// Attach a websocket relay
    ///
    /// A relay whose queue has closed no longer counts as attached, so a new
    /// client may take its place.
    ///
    /// # Errors
    ///
    /// [`AttachError::AlreadyAttached`] while a live relay is attached,
    /// [`AttachError::Closed`] once the stream has ended.
    pub fn attach(&self, sink: WebsocketSink) -> Result<(), AttachError> {
        let mut slot = self.relay.lock();
        if slot.closed {
            return Err(AttachError::Closed);
        }
        if let Some(existing) = slot.sink.as_ref().filter(|s| !s.is_closed()) {
            return Err(AttachError::AlreadyAttached {
                existing: existing.id(),
            });
        }
        info!(relay = %sink.id(), "Relay attached");
        slot.sink = Some(sink);
        Ok(())
    }

    /// Detach the current relay, letting it drain what is already queued
    ///
    /// Returns the detached relay id, if one was attached.
    pub fn detach(&self) -> Option<Uuid> {
        let sink = self.relay.lock().sink.take()?;
        sink.close();
        info!(relay = %sink.id(), "Relay detached");
        Some(sink.id())
    }

    fn detach_if(&self, id: Uuid) {
        let mut slot = self.relay.lock();
        if slot.sink.as_ref().is_some_and(|s| s.id() == id) {
            slot.sink = None;
            debug!(relay = %id, "Closed relay detached");
        }
    }

    /// Whether a live relay is attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.relay
            .lock()
            .sink
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    /// Whether new relays can still attach
    #[must_use]
    pub fn accepts_relays(&self) -> bool {
        !self.relay.lock().closed
    }

    /// Slot status as seen by an incoming upgrade request
    #[must_use]
    pub fn slot(&self) -> RelaySlot {
        let slot = self.relay.lock();
        if slot.closed {
            RelaySlot::Closed
        } else if slot.sink.as_ref().is_some_and(|s| !s.is_closed()) {
            RelaySlot::Occupied
        } else {
            RelaySlot::Free
        }
    }

    /// End of stream: close the attached relay queue from the producer side
    ///
    /// Records already queued are still written before the relay closes its
    /// socket. Later attach attempts fail with [`AttachError::Closed`].
    /// Idempotent.
    pub fn close_sinks(&self) {
        let sink = {
            let mut slot = self.relay.lock();
            slot.closed = true;
            slot.sink.take()
        };
        if let Some(sink) = sink {
            if sink.close() {
                debug!(relay = %sink.id(), "Relay queue closed for draining");
            }
        }
    }

    /// Snapshot of the dispatcher counters
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
            websocket_enqueued: self.websocket_enqueued.load(Ordering::Relaxed),
            websocket_dropped: self.websocket_dropped.load(Ordering::Relaxed),
        }
    }
}
