//! Relay Server
//!
//! Listens for websocket upgrade requests from browser clients and turns each
//! accepted one into a [`RelayConnection`] fed by the dispatcher.
//!
//! # Handshake
//!
//! | Condition | Response |
//! |---|---|
//! | path is not the configured relay path | `404 Not Found` |
//! | `Origin` missing or not allowed | `403 Forbidden` |
//! | another live client is attached | `409 Conflict` |
//! | the stream has ended | `503 Service Unavailable` |
//! | otherwise | `101 Switching Protocols` |
//!
//! Rejected requests never touch the dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::connection::{RelayConnection, RelayOutcome};
use super::origin::OriginPolicy;
use super::queue::RelayQueue;
use super::state::{RelayEvent, RelayStateMachine, TransitionError};
use super::RelayError;
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::sink::WebsocketSink;

/// Shared state for connection handlers
struct RelayContext {
    config: RelayConfig,
    policy: OriginPolicy,
    dispatcher: Arc<Dispatcher>,
}

/// Websocket relay listener
pub struct RelayServer {
    listener: TcpListener,
    context: Arc<RelayContext>,
}

impl RelayServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// [`RelayError::Bind`] if the address is unavailable.
    pub async fn bind(config: RelayConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, RelayError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let policy = OriginPolicy::new(&config.allowed_origins);

        Ok(Self {
            listener,
            context: Arc::new(RelayContext {
                config,
                policy,
                dispatcher,
            }),
        })
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept upgrade requests until `cancel` fires
    ///
    /// Open relays then get `drain_timeout_ms` to finish writing what their
    /// queues still hold; whatever is left after that is shut down. Relays
    /// are always awaited before this returns.
    pub async fn run(self, cancel: CancellationToken) {
        let addr = self.local_addr().ok();
        info!(
            addr = ?addr,
            path = %self.context.config.path,
            origins = ?self.context.policy.allowed_origins(),
            "Relay listening"
        );

        let connections = CancellationToken::new();
        let mut relays: JoinSet<Option<RelayOutcome>> = JoinSet::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(open = relays.len(), "Relay server shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let id = Uuid::new_v4();
                    let context = Arc::clone(&self.context);
                    relays.spawn(
                        handle_client(id, stream, context, connections.child_token())
                            .instrument(tracing::info_span!("relay", %id, %peer)),
                    );
                }

                Some(finished) = relays.join_next(), if !relays.is_empty() => {
                    log_finished(finished);
                }
            }
        }

        drop(self.listener);
        let drain = Duration::from_millis(self.context.config.drain_timeout_ms);
        let drained = tokio::time::timeout(drain, async {
            while let Some(finished) = relays.join_next().await {
                log_finished(finished);
            }
        })
        .await;

        if drained.is_err() {
            warn!(open = relays.len(), ?drain, "Relays still open after drain timeout");
            connections.cancel();
            while let Some(finished) = relays.join_next().await {
                log_finished(finished);
            }
        }
    }
}

fn log_finished(finished: Result<Option<RelayOutcome>, tokio::task::JoinError>) {
    match finished {
        Ok(Some(outcome)) => debug!(
            relay = %outcome.id,
            reason = ?outcome.reason,
            sent = outcome.sent,
            "Relay task finished"
        ),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Relay task failed"),
    }
}

/// Handshake, attach, then relay until done
async fn handle_client(
    id: Uuid,
    stream: TcpStream,
    context: Arc<RelayContext>,
    cancel: CancellationToken,
) -> Option<RelayOutcome> {
    let mut machine = RelayStateMachine::new(context.policy.clone());
    let mut rejection: Option<String> = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let (status, reason) = match check_upgrade(request, &context, &mut machine) {
            Ok(()) => return Ok(response),
            Err(rejected) => rejected,
        };
        rejection = Some(reason.clone());
        let mut error = ErrorResponse::new(Some(reason));
        *error.status_mut() = status;
        Err(error)
    };

    let timeout = Duration::from_millis(context.config.handshake_timeout_ms);
    let socket = match tokio::time::timeout(
        timeout,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            match rejection {
                Some(reason) => info!(%reason, "Upgrade rejected"),
                None => debug!(error = %e, "Websocket handshake failed"),
            }
            return None;
        }
        Err(_) => {
            debug!(?timeout, "Websocket handshake timed out");
            return None;
        }
    };

    let queue = Arc::new(RelayQueue::new(
        context.config.queue_capacity,
        context.config.overflow,
    ));
    if let Err(e) = context
        .dispatcher
        .attach(WebsocketSink::new(id, Arc::clone(&queue)))
    {
        // Lost a race with another client between handshake and attach
        warn!(error = %e, "Relay attach failed after upgrade");
        let mut socket = socket;
        let frame = CloseFrame {
            code: CloseCode::Again,
            reason: e.to_string().into(),
        };
        if let Err(e) = socket.close(Some(frame)).await {
            debug!(error = %e, "Close after failed attach returned an error");
        }
        return None;
    }

    match RelayConnection::new(id, socket, queue, machine, cancel) {
        Ok(connection) => Some(connection.run().await),
        Err(e) => {
            error!(error = %e, "Relay could not start");
            None
        }
    }
}

/// Validate an upgrade request, returning the rejection status and reason
fn check_upgrade(
    request: &Request,
    context: &RelayContext,
    machine: &mut RelayStateMachine,
) -> Result<(), (StatusCode, String)> {
    if request.uri().path() != context.config.path {
        return Err((
            StatusCode::NOT_FOUND,
            format!("no relay at {}", request.uri().path()),
        ));
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let event = RelayEvent::UpgradeRequested {
        origin,
        slot: context.dispatcher.slot(),
    };

    machine.handle(event).map(|_| ()).map_err(|e| {
        let status = match e {
            TransitionError::OriginRejected { .. } => StatusCode::FORBIDDEN,
            TransitionError::SlotOccupied => StatusCode::CONFLICT,
            TransitionError::StreamClosed => StatusCode::SERVICE_UNAVAILABLE,
            TransitionError::Invalid { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.to_string())
    })
}
