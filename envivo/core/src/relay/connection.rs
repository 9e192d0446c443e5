//! Relay Connection Task
//!
//! Owns one upgraded websocket and moves serialized records from the relay
//! queue onto it, one text frame per record.
//!
//! The task ends when any of the following happens:
//! - the queue is closed and drained (stream ended)
//! - a write fails
//! - the client closes the connection
//! - cancellation
//!
//! On exit it discards whatever is still queued, so the producer sees a closed
//! sink on its next push, and closes the socket exactly once.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queue::RelayQueue;
use super::state::{CloseReason, RelayEvent, RelayState, RelayStateMachine, TransitionError};
use super::RelayError;

/// Summary of a finished relay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Relay id
    pub id: Uuid,
    /// Why the relay ended
    pub reason: CloseReason,
    /// Records written to the socket
    pub sent: u64,
    /// Records still queued when the relay closed
    pub discarded: usize,
}

/// A websocket relay ready to run
pub struct RelayConnection<S> {
    id: Uuid,
    socket: WebSocketStream<S>,
    queue: Arc<RelayQueue>,
    machine: RelayStateMachine,
    cancel: CancellationToken,
    state_tx: watch::Sender<RelayState>,
}

impl<S> RelayConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an upgraded socket
    ///
    /// # Errors
    ///
    /// [`RelayError::Transition`] unless `machine` is in the `Attached` state.
    pub fn new(
        id: Uuid,
        socket: WebSocketStream<S>,
        queue: Arc<RelayQueue>,
        machine: RelayStateMachine,
        cancel: CancellationToken,
    ) -> Result<Self, RelayError> {
        if machine.state() != RelayState::Attached {
            return Err(RelayError::Transition(TransitionError::Invalid {
                state: machine.state(),
                event: "run",
            }));
        }
        let (state_tx, _) = watch::channel(RelayState::Attached);
        Ok(Self {
            id,
            socket,
            queue,
            machine,
            cancel,
            state_tx,
        })
    }

    /// Relay id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Observe state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state_tx.subscribe()
    }

    /// Relay records until one of the exit conditions is met
    pub async fn run(self) -> RelayOutcome {
        let Self {
            id,
            socket,
            queue,
            mut machine,
            cancel,
            state_tx,
        } = self;

        let (mut outbound, mut inbound) = socket.split();
        let mut sent = 0_u64;

        let reason = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break CloseReason::Shutdown,

                msg = inbound.next() => match msg {
                    None | Some(Ok(Message::Close(_))) => break CloseReason::PeerClosed,
                    Some(Err(e)) => {
                        debug!(relay = %id, error = %e, "Websocket read failed");
                        break CloseReason::PeerClosed;
                    }
                    // Client messages carry nothing for us; pings are answered
                    // by the protocol layer.
                    Some(Ok(_)) => {}
                },

                item = queue.pop() => {
                    let Some(payload) = item else {
                        break CloseReason::StreamEnded;
                    };
                    if let Err(e) = outbound.send(Message::Text(payload)).await {
                        warn!(relay = %id, error = %e, "Websocket write failed");
                        break CloseReason::WriteFailed;
                    }
                    sent += 1;
                }
            }
        };

        apply(&mut machine, &state_tx, id, RelayEvent::CloseRequested(reason));
        let discarded = queue.discard();

        if machine.state() == RelayState::Closing {
            if let Err(e) = outbound.close().await {
                debug!(relay = %id, error = %e, "Websocket close returned an error");
            }
            apply(&mut machine, &state_tx, id, RelayEvent::SocketClosed);
        }

        info!(relay = %id, ?reason, sent, discarded, "Relay closed");
        RelayOutcome {
            id,
            reason,
            sent,
            discarded,
        }
    }
}

fn apply(
    machine: &mut RelayStateMachine,
    state_tx: &watch::Sender<RelayState>,
    id: Uuid,
    event: RelayEvent,
) {
    match machine.handle(event) {
        Ok(t) if t.changed() => {
            debug!(relay = %id, from = %t.from, to = %t.to, "Relay state changed");
            state_tx.send_replace(t.to);
        }
        Ok(_) => {}
        Err(e) => warn!(relay = %id, error = %e, "Relay transition refused"),
    }
}
