//! Websocket Relay
//!
//! Forwards enriched records to a single live browser client.
//!
//! ```text
//! Dispatcher ──push──► RelayQueue ──pop──► RelayConnection ──text frame──► browser
//!     ▲                (bounded)          (owns the socket)
//!     │ attach
//! RelayServer (handshake: path, Origin, slot)
//! ```
//!
//! The producer and the connection task share only the queue. A slow client
//! loses the oldest pending records (by default) instead of slowing the
//! stream down.

pub mod connection;
pub mod origin;
pub mod queue;
pub mod server;
pub mod state;

use thiserror::Error;

pub use connection::{RelayConnection, RelayOutcome};
pub use origin::{OriginPolicy, OriginValidationResult};
pub use queue::{BufferOverflowPolicy, PushOutcome, QueueClosed, QueueStats, RelayQueue};
pub use server::RelayServer;
pub use state::{
    CloseReason, RelayEvent, RelaySlot, RelayState, RelayStateMachine, Transition,
    TransitionError,
};

/// Relay setup errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listener could not be bound
    #[error("failed to bind relay listener on {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The relay state machine refused an event
    #[error(transparent)]
    Transition(#[from] TransitionError),
}
