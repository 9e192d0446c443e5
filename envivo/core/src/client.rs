//! Feed Client
//!
//! Authenticated HTTP access to the remote API. Opens the filtered stream and
//! is shared with the rule client.

use std::io;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::config::{ApiConfig, TOKEN_ENV};
use crate::error::{ConfigError, StreamError};

/// Stream endpoint, relative to the API base URL
pub const STREAM_PATH: &str = "/tweets/search/stream";

/// Rules endpoint, relative to the API base URL
pub const RULES_PATH: &str = "/tweets/search/stream/rules";

/// Query parameters requesting the fields the pipeline needs
pub const STREAM_QUERY: &[(&str, &str)] = &[
    ("tweet.fields", "created_at,lang"),
    ("expansions", "author_id"),
];

/// Maximum number of body bytes kept when reporting an error status
const ERROR_BODY_LIMIT: usize = 2048;

/// Authenticated client for the remote API
#[derive(Clone, Debug)]
pub struct FeedClient {
    http: reqwest::Client,
    base_url: String,
}

impl FeedClient {
    /// Build a client from API settings
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingCredential`] if the bearer token is empty,
    /// [`ConfigError::InvalidValue`] if it cannot be sent as a header or the
    /// HTTP client cannot be built.
    pub fn new(config: &ApiConfig) -> Result<Self, ConfigError> {
        let token = config.bearer_token.trim();
        if token.is_empty() {
            return Err(ConfigError::MissingCredential(TOKEN_ENV));
        }

        let mut auth = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
            ConfigError::InvalidValue {
                key: TOKEN_ENV,
                value: "<redacted>".to_string(),
                reason: e.to_string(),
            }
        })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent(concat!("envivo/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "api",
                value: config.base_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL in use
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full stream URL, without query parameters
    #[must_use]
    pub fn stream_url(&self) -> String {
        format!("{}{STREAM_PATH}", self.base_url)
    }

    /// Full rules URL
    #[must_use]
    pub fn rules_url(&self) -> String {
        format!("{}{RULES_PATH}", self.base_url)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Open the filtered stream
    ///
    /// Returns the response body as a buffered async reader. Dropping the
    /// reader releases the connection.
    ///
    /// # Errors
    ///
    /// [`StreamError::Connect`] if the request fails,
    /// [`StreamError::HttpStatus`] for a non-success status.
    pub async fn connect_stream(
        &self,
    ) -> Result<impl AsyncBufRead + Send + Unpin + 'static, StreamError> {
        let url = self.stream_url();
        debug!(%url, "Connecting to stream");

        let response = self
            .http
            .get(&url)
            .query(STREAM_QUERY)
            .send()
            .await
            .map_err(StreamError::Connect)?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(StreamError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        info!(status = status.as_u16(), "Stream connected");
        let body = response.bytes_stream().map_err(io::Error::other).boxed();
        Ok(StreamReader::new(body))
    }
}

/// Read an error response body, truncated for logs
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(mut text) => {
            if text.len() > ERROR_BODY_LIMIT {
                let mut end = ERROR_BODY_LIMIT;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text.truncate(end);
            }
            text
        }
        Err(e) => format!("<unreadable body: {e}>"),
    }
}
