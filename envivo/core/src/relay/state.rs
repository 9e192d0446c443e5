//! Relay State Machine
//!
//! Lifecycle of a single websocket relay, driven by explicit events rather
//! than by handler closures capturing mutable state.
//!
//! ```text
//!          UpgradeRequested (origin allowed, slot free)
//! Unattached ─────────────────────────────────────► Attached
//!     │                                                │
//!     │ UpgradeRequested (origin denied or             │ StreamEnded | WriteFailed
//!     │ slot taken): rejected, state unchanged         │ PeerClosed  | Shutdown
//!     ▼                                                ▼
//! Unattached                                        Closing
//!                                                      │ SocketClosed (exactly once)
//!                                                      ▼
//!                                                   Closed
//! ```

use std::fmt;

use thiserror::Error;

use super::origin::OriginPolicy;

/// Relay lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelayState {
    /// No client connection yet
    Unattached,
    /// A client is connected and records are being relayed
    Attached,
    /// The relay stopped consuming and is closing the socket
    Closing,
    /// The socket is closed and the queue released
    Closed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unattached => "unattached",
            Self::Attached => "attached",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a relay left the `Attached` state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream session ended and the queue was drained
    StreamEnded,
    /// Writing to the socket failed
    WriteFailed,
    /// The client closed the connection
    PeerClosed,
    /// Process or server shutdown
    Shutdown,
}

/// Whether the dispatcher can take a new relay
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RelaySlot {
    /// No live relay is attached
    #[default]
    Free,
    /// Another live relay is attached
    Occupied,
    /// The stream has ended; nothing more will be relayed
    Closed,
}

/// Inputs to the relay state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    /// An upgrade request arrived
    UpgradeRequested {
        /// `Origin` header value, if any
        origin: Option<String>,
        /// Dispatcher slot status when the request arrived
        slot: RelaySlot,
    },
    /// A condition that ends the relay
    CloseRequested(CloseReason),
    /// The socket has been closed
    SocketClosed,
}

/// A state change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State before the event
    pub from: RelayState,
    /// State after the event
    pub to: RelayState,
}

impl Transition {
    /// Whether the event changed the state
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Events the state machine refused
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The upgrade request failed the origin check
    #[error("upgrade rejected: {reason}")]
    OriginRejected {
        /// Reason reported by the origin policy
        reason: String,
    },
    /// Another client is already being relayed to
    #[error("a relay client is already attached")]
    SlotOccupied,
    /// The stream has ended
    #[error("the stream has ended")]
    StreamClosed,
    /// The event is not valid in the current state
    #[error("event {event} is not valid in state {state}")]
    Invalid {
        /// Current state
        state: RelayState,
        /// Short event name
        event: &'static str,
    },
}

/// Relay lifecycle state machine
#[derive(Clone, Debug)]
pub struct RelayStateMachine {
    state: RelayState,
    policy: OriginPolicy,
    close_reason: Option<CloseReason>,
}

impl RelayStateMachine {
    /// Create a machine in the `Unattached` state
    #[must_use]
    pub fn new(policy: OriginPolicy) -> Self {
        Self {
            state: RelayState::Unattached,
            policy,
            close_reason: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Reason the relay started closing, if it has
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Apply an event
    ///
    /// Close requests after the relay has started closing are accepted and
    /// ignored, so concurrent close triggers collapse into one close. A second
    /// `SocketClosed` is an error: the socket must be closed exactly once.
    ///
    /// # Errors
    ///
    /// [`TransitionError`] if the event is refused; the state is unchanged.
    pub fn handle(&mut self, event: RelayEvent) -> Result<Transition, TransitionError> {
        let from = self.state;
        let to = match (from, event) {
            (RelayState::Unattached, RelayEvent::UpgradeRequested { origin, slot }) => {
                let result = self.policy.validate(origin.as_deref());
                if let Some(reason) = result.denial_reason() {
                    return Err(TransitionError::OriginRejected {
                        reason: reason.to_string(),
                    });
                }
                match slot {
                    RelaySlot::Free => RelayState::Attached,
                    RelaySlot::Occupied => return Err(TransitionError::SlotOccupied),
                    RelaySlot::Closed => return Err(TransitionError::StreamClosed),
                }
            }
            (state, RelayEvent::UpgradeRequested { .. }) => {
                return Err(TransitionError::Invalid {
                    state,
                    event: "upgrade",
                });
            }

            (RelayState::Attached, RelayEvent::CloseRequested(reason)) => {
                self.close_reason = Some(reason);
                RelayState::Closing
            }
            (RelayState::Unattached, RelayEvent::CloseRequested(_)) => RelayState::Closed,
            (state @ (RelayState::Closing | RelayState::Closed), RelayEvent::CloseRequested(_)) => {
                state
            }

            (RelayState::Closing, RelayEvent::SocketClosed) => RelayState::Closed,
            (state, RelayEvent::SocketClosed) => {
                return Err(TransitionError::Invalid {
                    state,
                    event: "socket-closed",
                });
            }
        };

        self.state = to;
        Ok(Transition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn machine() -> RelayStateMachine {
        RelayStateMachine::new(OriginPolicy::new(["http://localhost:8080"]))
    }

    fn upgrade(origin: &str) -> RelayEvent {
        RelayEvent::UpgradeRequested {
            origin: Some(origin.to_string()),
            slot: RelaySlot::Free,
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let mut m = machine();
        assert_eq!(m.state(), RelayState::Unattached);

        m.handle(upgrade("http://localhost:8080")).unwrap();
        assert_eq!(m.state(), RelayState::Attached);

        let t = m
            .handle(RelayEvent::CloseRequested(CloseReason::StreamEnded))
            .unwrap();
        assert_eq!(t.to, RelayState::Closing);
        assert_eq!(m.close_reason(), Some(CloseReason::StreamEnded));

        m.handle(RelayEvent::SocketClosed).unwrap();
        assert_eq!(m.state(), RelayState::Closed);
    }

    #[test]
    fn test_rejected_origin_leaves_state_unchanged() {
        let mut m = machine();
        let err = m.handle(upgrade("https://evil.com")).unwrap_err();

        assert!(matches!(err, TransitionError::OriginRejected { .. }));
        assert_eq!(m.state(), RelayState::Unattached);
    }

    #[test]
    fn test_missing_origin_is_rejected() {
        let mut m = machine();
        assert!(m
            .handle(RelayEvent::UpgradeRequested {
                origin: None,
                slot: RelaySlot::Free,
            })
            .is_err());
        assert_eq!(m.state(), RelayState::Unattached);
    }

    #[test]
    fn test_occupied_slot_is_rejected() {
        let mut m = machine();
        let err = m
            .handle(RelayEvent::UpgradeRequested {
                origin: Some("http://localhost:8080".into()),
                slot: RelaySlot::Occupied,
            })
            .unwrap_err();
        assert_eq!(err, TransitionError::SlotOccupied);
        assert_eq!(m.state(), RelayState::Unattached);
    }

    #[test]
    fn test_origin_is_checked_before_slot() {
        let mut m = machine();
        let err = m
            .handle(RelayEvent::UpgradeRequested {
                origin: Some("https://evil.com".into()),
                slot: RelaySlot::Closed,
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::OriginRejected { .. }));
    }

    #[test]
    fn test_second_upgrade_is_invalid() {
        let mut m = machine();
        m.handle(upgrade("http://localhost:8080")).unwrap();
        let err = m.handle(upgrade("http://localhost:8080")).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Invalid {
                state: RelayState::Attached,
                event: "upgrade",
            }
        );
    }

    #[test]
    fn test_close_triggers_collapse() {
        let mut m = machine();
        m.handle(upgrade("http://localhost:8080")).unwrap();
        m.handle(RelayEvent::CloseRequested(CloseReason::WriteFailed))
            .unwrap();

        let t = m
            .handle(RelayEvent::CloseRequested(CloseReason::Shutdown))
            .unwrap();
        assert!(!t.changed());
        assert_eq!(m.close_reason(), Some(CloseReason::WriteFailed));
    }

    #[test]
    fn test_socket_closes_exactly_once() {
        let mut m = machine();
        m.handle(upgrade("http://localhost:8080")).unwrap();
        m.handle(RelayEvent::CloseRequested(CloseReason::PeerClosed))
            .unwrap();
        m.handle(RelayEvent::SocketClosed).unwrap();

        assert!(m.handle(RelayEvent::SocketClosed).is_err());
        assert_eq!(m.state(), RelayState::Closed);
    }

    #[test]
    fn test_socket_closed_before_closing_is_invalid() {
        let mut m = machine();
        m.handle(upgrade("http://localhost:8080")).unwrap();
        assert!(m.handle(RelayEvent::SocketClosed).is_err());
        assert_eq!(m.state(), RelayState::Attached);
    }

    #[test]
    fn test_shutdown_while_unattached_closes() {
        let mut m = machine();
        m.handle(RelayEvent::CloseRequested(CloseReason::Shutdown))
            .unwrap();
        assert_eq!(m.state(), RelayState::Closed);
    }
}
