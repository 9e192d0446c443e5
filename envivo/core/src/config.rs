//! Configuration
//!
//! Settings for every component, layered from lowest to highest precedence:
//!
//! 1. Built-in defaults
//! 2. TOML config file (`$XDG_CONFIG_HOME/envivo/config.toml`, or the path in
//!    `ENVIVO_CONFIG`)
//! 3. Environment variables (a `.env` file is loaded into the environment by
//!    the binary before this runs)
//! 4. Command-line flags, applied by the binary on the loaded value
//!
//! The resulting [`EnvivoConfig`] is passed to constructors. Nothing reads
//! configuration from globals after startup.
//!
//! # Environment variables
//!
//! | Variable | Setting |
//! |---|---|
//! | `API_TOKEN` | bearer token (required) |
//! | `ENVIVO_API_BASE_URL` | API base URL |
//! | `WEBSOCKET_PORT` | relay listen port |
//! | `ALLOWED_ORIGINS` | comma-separated origin allow-list |
//! | `ACCEPTED_LANGS` | comma-separated language allow-list |
//! | `ENVIVO_UNSET_LANG` | `pass` or `drop` |
//! | `ENVIVO_RELAY_OVERFLOW` | `drop-oldest` or `block:<millis>` |
//! | `ENVIVO_RECONNECT_ATTEMPTS` | reconnect attempts (0 disables) |
//! | `ENVIVO_TERMINAL_STYLE` | `color`, `plain` or `json` |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::enrich::{LanguageFilter, UnsetLanguagePolicy};
use crate::error::ConfigError;
use crate::relay::queue::{BufferOverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::sink::TerminalStyle;
use crate::supervisor::ReconnectPolicy;

/// Default API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.twitter.com/2";

/// Default relay port
pub const DEFAULT_WEBSOCKET_PORT: u16 = 5000;

/// Default relay path
pub const DEFAULT_WEBSOCKET_PATH: &str = "/ws";

/// Default origin allow-list
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:8080";

/// Languages accepted unless configured otherwise
pub const DEFAULT_ACCEPTED_LANGS: &[&str] = &["en", "es", "pt"];

/// Environment variable holding the bearer token
pub const TOKEN_ENV: &str = "API_TOKEN";

// ============================================================================
// Sections
// ============================================================================

/// Remote API settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bearer token
    #[serde(skip_serializing)]
    pub bearer_token: String,
    /// Base URL, without trailing slash
    pub base_url: String,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bearer_token: String::new(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = if self.bearer_token.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("ApiConfig")
            .field("bearer_token", &token)
            .field("base_url", &self.base_url)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

/// Language filter settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Accepted language tags; must not be empty
    pub accepted_languages: Vec<String>,
    /// Policy for events without a language tag
    pub unset_language: UnsetLanguagePolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            accepted_languages: DEFAULT_ACCEPTED_LANGS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            unset_language: UnsetLanguagePolicy::default(),
        }
    }
}

impl FilterConfig {
    /// Build the language filter
    #[must_use]
    pub fn language_filter(&self) -> LanguageFilter {
        LanguageFilter::new(self.accepted_languages.iter().cloned(), self.unset_language)
    }
}

/// Websocket relay settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Whether to run the relay alongside the stream
    pub enabled: bool,
    /// Listen address
    pub bind_address: String,
    /// Listen port (0 picks a free port)
    pub port: u16,
    /// Upgrade path
    pub path: String,
    /// Origin allow-list
    pub allowed_origins: Vec<String>,
    /// Records buffered per client
    pub queue_capacity: usize,
    /// What to do when the client falls behind
    pub overflow: BufferOverflowPolicy,
    /// Upgrade handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// How long open relays may keep draining after shutdown starts
    pub drain_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_WEBSOCKET_PORT,
            path: DEFAULT_WEBSOCKET_PATH.to_string(),
            allowed_origins: vec![DEFAULT_ALLOWED_ORIGINS.to_string()],
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: BufferOverflowPolicy::default(),
            handshake_timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl RelayConfig {
    /// `host:port` to bind
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Terminal output settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Rendering style
    pub style: TerminalStyle,
}

// ============================================================================
// Root
// ============================================================================

/// Complete envivo configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvivoConfig {
    /// Remote API
    pub api: ApiConfig,
    /// Language filter
    pub filter: FilterConfig,
    /// Websocket relay
    pub relay: RelayConfig,
    /// Reconnect policy
    pub reconnect: ReconnectPolicy,
    /// Terminal output
    pub terminal: TerminalConfig,
}

impl EnvivoConfig {
    /// Load defaults, then the config file, then the process environment
    ///
    /// `path` overrides the config file location. Without it, `ENVIVO_CONFIG`
    /// is consulted, then the default path; a missing default file is fine.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if an explicit file is missing or any layer holds an
    /// invalid value. Completeness is checked separately by [`Self::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`Self::load`] with an explicit environment lookup
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| lookup("ENVIVO_CONFIG").map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Parse a TOML config file on top of the defaults
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] or [`ConfigError::Toml`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Overlay environment variables
    ///
    /// Unset and blank variables (`WEBSOCKET_PORT=` in a `.env` template)
    /// leave the current value alone.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] for unparseable values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(token) = lookup(TOKEN_ENV) {
            self.api.bearer_token = token.trim().to_string();
        }
        if let Some(url) = lookup("ENVIVO_API_BASE_URL") {
            self.api.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(port) = lookup("WEBSOCKET_PORT") {
            self.relay.port = parse_value("WEBSOCKET_PORT", &port)?;
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.relay.allowed_origins = split_list(&origins);
        }
        if let Some(langs) = lookup("ACCEPTED_LANGS") {
            self.filter.accepted_languages = split_list(&langs);
        }
        if let Some(policy) = lookup("ENVIVO_UNSET_LANG") {
            self.filter.unset_language = parse_value("ENVIVO_UNSET_LANG", &policy)?;
        }
        if let Some(overflow) = lookup("ENVIVO_RELAY_OVERFLOW") {
            self.relay.overflow = parse_value("ENVIVO_RELAY_OVERFLOW", &overflow)?;
        }
        if let Some(attempts) = lookup("ENVIVO_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = parse_value("ENVIVO_RECONNECT_ATTEMPTS", &attempts)?;
        }
        if let Some(style) = lookup("ENVIVO_TERMINAL_STYLE") {
            self.terminal.style = parse_value("ENVIVO_TERMINAL_STYLE", &style)?;
        }
        Ok(())
    }

    /// Check that the configuration is complete and usable
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingCredential`] without a bearer token,
    /// [`ConfigError::InvalidValue`] for malformed settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.bearer_token.is_empty() {
            return Err(ConfigError::MissingCredential(TOKEN_ENV));
        }
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue {
                key: "api.base_url",
                value: self.api.base_url.clone(),
                reason: "must be an http(s) URL".to_string(),
            });
        }
        if !self.relay.path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "relay.path",
                value: self.relay.path.clone(),
                reason: "must start with '/'".to_string(),
            });
        }
        if self.filter.accepted_languages.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "filter.accepted_languages",
                value: String::new(),
                reason: "at least one language is required".to_string(),
            });
        }
        if self.relay.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "relay.queue_capacity",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Default config file location
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("envivo").join("config.toml"))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EnvivoConfig::default();
        assert_eq!(config.api.base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.relay.port, 5000);
        assert_eq!(config.relay.path, "/ws");
        assert_eq!(config.relay.allowed_origins, vec!["http://localhost:8080"]);
        assert_eq!(config.filter.accepted_languages, vec!["en", "es", "pt"]);
        assert_eq!(config.filter.unset_language, UnsetLanguagePolicy::PassThrough);
        assert_eq!(config.reconnect.max_attempts, 0);
    }

    #[test]
    fn test_env_overlay() {
        let mut config = EnvivoConfig::default();
        config
            .apply_env(env(&[
                ("API_TOKEN", " secret "),
                ("WEBSOCKET_PORT", "9001"),
                ("ALLOWED_ORIGINS", "http://a.test, http://b.test"),
                ("ACCEPTED_LANGS", "ja"),
                ("ENVIVO_UNSET_LANG", "drop"),
                ("ENVIVO_RELAY_OVERFLOW", "block:100"),
            ]))
            .unwrap();

        assert_eq!(config.api.bearer_token, "secret");
        assert_eq!(config.relay.port, 9001);
        assert_eq!(
            config.relay.allowed_origins,
            vec!["http://a.test", "http://b.test"]
        );
        assert_eq!(config.filter.accepted_languages, vec!["ja"]);
        assert_eq!(config.filter.unset_language, UnsetLanguagePolicy::Drop);
        assert_eq!(
            config.relay.overflow,
            BufferOverflowPolicy::Block { timeout_ms: 100 }
        );
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let mut config = EnvivoConfig::default();
        let err = config
            .apply_env(env(&[("WEBSOCKET_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "WEBSOCKET_PORT",
                ..
            }
        ));
    }

    #[test]
    fn test_blank_env_values_are_unset() {
        let config = EnvivoConfig::load_with(
            None,
            env(&[
                ("API_TOKEN", "t"),
                ("WEBSOCKET_PORT", ""),
                ("ACCEPTED_LANGS", " "),
                ("ENVIVO_UNSET_LANG", ""),
                ("ENVIVO_RELAY_OVERFLOW", ""),
                ("ENVIVO_RECONNECT_ATTEMPTS", ""),
                ("ENVIVO_TERMINAL_STYLE", ""),
            ]),
        )
        .unwrap();

        assert_eq!(config.relay.port, 5000);
        assert_eq!(config.filter.accepted_languages, vec!["en", "es", "pt"]);
        assert_eq!(config.reconnect.max_attempts, 0);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_language_list_fails_validation() {
        let mut config = EnvivoConfig::default();
        config.api.bearer_token = "t".to_string();
        config.filter.accepted_languages.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                key: "filter.accepted_languages",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_token_fails_validation() {
        let config = EnvivoConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential("API_TOKEN"))
        ));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[api]
bearer_token = "from-file"

[relay]
port = 7000
path = "/live"

[relay.overflow]
policy = "block"
timeout_ms = 25

[filter]
accepted_languages = ["fr"]
unset_language = "drop"
"#
        )
        .unwrap();

        let config =
            EnvivoConfig::load_with(Some(file.path()), env(&[("WEBSOCKET_PORT", "7100")]))
                .unwrap();

        assert_eq!(config.api.bearer_token, "from-file");
        assert_eq!(config.relay.port, 7100);
        assert_eq!(config.relay.path, "/live");
        assert_eq!(
            config.relay.overflow,
            BufferOverflowPolicy::Block { timeout_ms: 25 }
        );
        assert_eq!(config.filter.accepted_languages, vec!["fr"]);
        assert_eq!(config.filter.unset_language, UnsetLanguagePolicy::Drop);
        assert_eq!(config.relay.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = EnvivoConfig::load_with(Some(&missing), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nport = \"high\"").unwrap();
        let err = EnvivoConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }

    #[test]
    fn test_validate_rejects_relative_path() {
        let mut config = EnvivoConfig::default();
        config.api.bearer_token = "t".into();
        config.relay.path = "ws".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                key: "relay.path",
                ..
            })
        ));
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut api = ApiConfig::default();
        api.bearer_token = "super-secret".into();
        let shown = format!("{api:?}");
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn test_empty_langs_env_disables_filter() {
        let mut config = EnvivoConfig::default();
        config.apply_env(env(&[("ACCEPTED_LANGS", "")])).unwrap();
        assert!(config.filter.language_filter().accepts(Some("ja")));
    }
}
