//! Enrichment & Filter
//!
//! Applies the language allow-list to decoded events and turns the ones that
//! pass into display-ready [`EnrichedRecord`]s.
//!
//! Enrichment is a pure function of the event and the filter configuration.
//! [`Enricher`] holds no interior mutability, so it can be cloned into as many
//! tasks as needed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::event::{MatchingRule, StreamEvent};

/// Base URL for permalinks and profile links
pub const WEB_BASE_URL: &str = "https://twitter.com";

/// What to do with events the remote did not tag with a language
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnsetLanguagePolicy {
    /// Keep events without a language tag (default)
    #[default]
    PassThrough,
    /// Drop events without a language tag
    Drop,
}

impl std::str::FromStr for UnsetLanguagePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pass" | "pass-through" | "passthrough" | "keep" => Ok(Self::PassThrough),
            "drop" | "skip" => Ok(Self::Drop),
            other => Err(format!("expected \"pass\" or \"drop\", got {other:?}")),
        }
    }
}

/// Language allow-list predicate
///
/// A tagged event passes only if its tag is in the accepted set, so an empty
/// set drops every tagged event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageFilter {
    accepted: HashSet<String>,
    unset_policy: UnsetLanguagePolicy,
}

impl LanguageFilter {
    /// Create a filter accepting the given BCP-47 tags
    pub fn new<I, S>(accepted: I, unset_policy: UnsetLanguagePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accepted: accepted
                .into_iter()
                .map(Into::into)
                .map(|tag: String| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect(),
            unset_policy,
        }
    }

    /// Whether an event with this language tag passes the filter
    #[must_use]
    pub fn accepts(&self, lang: Option<&str>) -> bool {
        match lang {
            None => self.unset_policy == UnsetLanguagePolicy::PassThrough,
            Some(tag) => self.accepted.contains(tag),
        }
    }

    /// Policy applied to events without a language tag
    #[must_use]
    pub fn unset_policy(&self) -> UnsetLanguagePolicy {
        self.unset_policy
    }
}

/// Display-ready record delivered to sinks
///
/// Field names on the wire match what the browser client expects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    /// Author user id
    #[serde(rename = "authorId")]
    pub author_id: String,
    /// Author display name
    #[serde(rename = "authorName")]
    pub author_name: String,
    /// Author handle
    #[serde(rename = "authorUsername")]
    pub author_username: String,
    /// Creation timestamp as sent by the remote
    pub created_at: String,
    /// Record (tweet) id
    pub id: String,
    /// Rules that matched
    pub matching_rules: Vec<MatchingRule>,
    /// Record text
    pub text: String,
    /// Permalink to the record
    #[serde(rename = "tweetUrl")]
    pub tweet_url: String,
    /// Link to the author's profile
    #[serde(rename = "userUrl")]
    pub user_url: String,
}

/// Filters and enriches decoded events
#[derive(Clone, Debug)]
pub struct Enricher {
    filter: LanguageFilter,
    web_base_url: String,
}

impl Enricher {
    /// Create an enricher with the given language filter
    #[must_use]
    pub fn new(filter: LanguageFilter) -> Self {
        Self {
            filter,
            web_base_url: WEB_BASE_URL.to_string(),
        }
    }

    /// Override the base URL used for permalinks
    #[must_use]
    pub fn with_web_base_url(mut self, url: impl Into<String>) -> Self {
        self.web_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// The language filter in use
    #[must_use]
    pub fn filter(&self) -> &LanguageFilter {
        &self.filter
    }

    /// Filter and enrich one event
    ///
    /// Returns `Ok(None)` when the event is filtered out. Filtering has no
    /// side effects.
    ///
    /// # Errors
    ///
    /// [`DecodeError::MissingAuthor`] if an event that passed the filter
    /// references an author absent from its includes.
    pub fn process(&self, event: &StreamEvent) -> Result<Option<EnrichedRecord>, DecodeError> {
        if !self.filter.accepts(event.lang.as_deref()) {
            return Ok(None);
        }

        let author = event.author().ok_or_else(|| DecodeError::MissingAuthor {
            event_id: event.id.clone(),
            author_id: event.author_id.clone(),
        })?;

        let user_url = format!("{}/{}", self.web_base_url, author.username);
        let tweet_url = format!("{user_url}/status/{}", event.id);

        Ok(Some(EnrichedRecord {
            author_id: author.id.clone(),
            author_name: author.name.clone(),
            author_username: author.username.clone(),
            created_at: event.created_at.clone(),
            id: event.id.clone(),
            matching_rules: event.matching_rules.clone(),
            text: event.text.clone(),
            tweet_url,
            user_url,
        }))
    }
}
