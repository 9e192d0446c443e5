//! Envivo Core - Live feed streaming pipeline
//!
//! This crate holds everything between the filtered-stream HTTP endpoint and
//! the places enriched records end up: the terminal and, optionally, a single
//! browser connected over a websocket relay.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          StreamSession                               │
//! │                                                                      │
//! │  FeedClient ──bytes──► ChunkFramer ──frame──► decode ──event──►      │
//! │                        (CRLF, keep-alive)    (StreamEvent)           │
//! │                                                                      │
//! │      ──► Enricher ──record──► Dispatcher ──┬──► TerminalSink         │
//! │          (language filter,                 │                         │
//! │           author, urls)                    └──► WebsocketSink        │
//! │                                                  │ RelayQueue        │
//! └──────────────────────────────────────────────────┼───────────────────┘
//!                                                    ▼
//!                          RelayServer ──► RelayConnection ──► browser
//! ```
//!
//! The session owns the producer task. It ends when the remote closes the
//! response, when it is stopped, or on the first fatal error; sessions never
//! retry on their own. [`supervise`] restarts them under a
//! [`ReconnectPolicy`].
//!
//! # Key Types
//!
//! - [`StreamSession`] / [`SessionHandle`]: lifecycle of one stream connection
//! - [`Dispatcher`]: fan-out to the terminal and the attached relay
//! - [`RelayServer`]: websocket upgrade handling, one live client at a time
//! - [`RuleClient`]: list, add, delete the stream's filter rules
//! - [`EnvivoConfig`]: layered configuration (file, then environment)
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use envivo_core::{
//!     Dispatcher, Enricher, EnvivoConfig, FeedClient, StreamSession, TerminalSink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EnvivoConfig::load(None)?;
//!     config.validate()?;
//!
//!     let dispatcher = Arc::new(Dispatcher::new(Box::new(TerminalSink::stdout(
//!         config.terminal.style,
//!     ))));
//!     let session = StreamSession::new(
//!         FeedClient::new(&config.api)?,
//!         Enricher::new(config.filter.language_filter()),
//!         dispatcher,
//!     );
//!
//!     let handle = session.start().await?;
//!     let summary = handle.wait().await.into_result()?;
//!     println!("{} records dispatched", summary.dispatched);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`framer`]: splits the chunked response body into frames
//! - [`event`]: decodes one frame into a [`StreamEvent`]
//! - [`enrich`]: language filter and record construction
//! - [`sink`]: terminal and websocket output
//! - [`dispatch`]: fan-out and relay attachment
//! - [`relay`]: websocket server, per-client state machine and queue
//! - [`session`]: stream session lifecycle
//! - [`supervisor`]: reconnect policy
//! - [`client`]: authenticated HTTP client for the stream
//! - [`rules`]: rules endpoint client
//! - [`config`]: configuration loading
//! - [`error`]: shared error types

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod dispatch;
pub mod enrich;
pub mod error;
pub mod event;
pub mod framer;
pub mod relay;
pub mod rules;
pub mod session;
pub mod sink;
pub mod supervisor;

// Pipeline exports
pub use enrich::{EnrichedRecord, Enricher, LanguageFilter, UnsetLanguagePolicy};
pub use event::{decode, MatchingRule, StreamEvent, User};
pub use framer::ChunkFramer;

// Output exports
pub use dispatch::{AttachError, DispatchReport, DispatchStats, Dispatcher, WebsocketDelivery};
pub use sink::{Sink, SinkError, TerminalSink, TerminalStyle, WebsocketSink};

// Relay exports
pub use relay::{
    BufferOverflowPolicy, OriginPolicy, RelayError, RelayServer, RelayState, RelayStateMachine,
};

// Session exports
pub use session::{
    EndReason, SessionHandle, SessionId, SessionOutcome, SessionState, SessionSummary,
    StreamSession,
};
pub use supervisor::{supervise, ReconnectPolicy};

// Remote API exports
pub use client::FeedClient;
pub use rules::{load_rules_file, AddRulesRequest, NewRule, Rule, RuleClient, RuleError};

// Config and error exports
pub use config::{EnvivoConfig, TOKEN_ENV};
pub use error::{ConfigError, DecodeError, StreamError};
