//! Error Types
//!
//! Error taxonomy shared by the streaming core.
//!
//! - Transport errors (connect, HTTP status, body read) end the current session.
//! - Decode errors mean the remote framing contract was violated and are fatal
//!   to the session as well.
//! - Configuration errors are raised before any I/O begins.
//!
//! Sink and relay failures have their own error types in [`crate::sink`] and
//! [`crate::relay`] because they never end the producer.

use thiserror::Error;

/// Maximum number of payload bytes kept in a decode error preview
const PREVIEW_BYTES: usize = 120;

/// Errors that end a streaming session
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream request could not be sent or the connection failed
    #[error("failed to connect to the stream: {0}")]
    Connect(#[source] reqwest::Error),

    /// The stream endpoint answered with a non-success status
    #[error("stream endpoint returned {status}: {body}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Response body (truncated by the server, if at all)
        body: String,
    },

    /// Reading the response body failed mid-stream
    #[error("stream read failed: {0}")]
    Read(#[from] std::io::Error),

    /// A frame could not be turned into an event
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Invalid configuration detected before connecting
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The producer task panicked or was aborted
    #[error("session task failed: {0}")]
    Task(String),
}

impl StreamError {
    /// Whether this error came from the transport (network or body read)
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::HttpStatus { .. } | Self::Read(_)
        )
    }
}

/// Errors raised while turning a frame into an event
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not a valid event object
    #[error("malformed stream frame ({source}): {preview}")]
    Json {
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
        /// Leading bytes of the frame, lossily decoded
        preview: String,
    },

    /// The event references an author that is not in its includes
    #[error("event {event_id} references author {author_id} missing from includes")]
    MissingAuthor {
        /// Event id
        event_id: String,
        /// Author id that failed to resolve
        author_id: String,
    },

    /// The remote sent an error object instead of an event
    #[error("remote stream error: {}", messages.join("; "))]
    Remote {
        /// Error titles and details reported by the remote
        messages: Vec<String>,
    },
}

impl DecodeError {
    /// Build a JSON decode error with a preview of the offending bytes
    #[must_use]
    pub fn json(source: serde_json::Error, frame: &[u8]) -> Self {
        let end = frame.len().min(PREVIEW_BYTES);
        Self::Json {
            source,
            preview: String::from_utf8_lossy(&frame[..end]).into_owned(),
        }
    }
}

/// Configuration errors, raised before any network call
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required credential is missing or empty
    #[error("missing credential: set {0} (environment or .env file)")]
    MissingCredential(&'static str),

    /// Rule deletion was requested with no ids
    #[error("you must pass in stream rule ids to delete")]
    EmptyDeleteIds,

    /// A setting has an unusable value
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        /// Setting name
        key: &'static str,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A config or rules file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A config file could not be parsed
    #[error("failed to parse config file {path}: {source}")]
    Toml {
        /// File path
        path: String,
        /// Underlying parse error
        #[source]
        source: toml::de::Error,
    },

    /// A rules file could not be parsed
    #[error("failed to parse rules file {path}: {source}")]
    RulesFile {
        /// File path
        path: String,
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
    },
}
