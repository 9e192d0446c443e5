//! Stream Events
//!
//! Data model for decoded feed events and the decoder that produces them
//! from raw frames.
//!
//! # Wire Shape
//!
//! ```json
//! {
//!   "data": {"id": "1", "text": "...", "author_id": "42",
//!            "created_at": "2020-08-19T03:32:36.000Z", "lang": "en"},
//!   "matching_rules": [{"id": "1295...", "tag": "cats"}],
//!   "includes": {"users": [{"id": "42", "name": "...", "username": "..."}]}
//! }
//! ```
//!
//! The remote occasionally sends `{"errors": [...]}` objects on the same
//! connection (for example before an operational disconnect). Those decode to
//! [`DecodeError::Remote`].

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// A rule that matched an event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingRule {
    /// Rule id (the remote sends it as a string, older payloads as a number)
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Rule tag, empty when the rule has none
    #[serde(default)]
    pub tag: String,
}

/// A user object from the event's includes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: String,
    /// Display name
    pub name: String,
    /// Handle, without the leading `@`
    pub username: String,
}

/// A decoded stream event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEvent {
    /// Event (tweet) id
    pub id: String,
    /// Event text
    pub text: String,
    /// Id of the authoring user
    pub author_id: String,
    /// Creation timestamp as sent by the remote (RFC 3339)
    pub created_at: String,
    /// BCP-47 language tag, if the remote detected one
    pub lang: Option<String>,
    /// Rules that matched, in the order the remote listed them
    pub matching_rules: Vec<MatchingRule>,
    /// Users referenced by the event, keyed by user id
    pub included_users: HashMap<String, User>,
}

impl StreamEvent {
    /// Look up the event's author in the included users
    #[must_use]
    pub fn author(&self) -> Option<&User> {
        self.included_users.get(&self.author_id)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Deserialize)]
struct WireEnvelope {
    data: Option<WireTweet>,
    #[serde(default)]
    matching_rules: Vec<MatchingRule>,
    #[serde(default)]
    includes: WireIncludes,
    #[serde(default)]
    errors: Vec<WireError>,
}

#[derive(Deserialize)]
struct WireTweet {
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    author_id: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    lang: Option<String>,
}

#[derive(Default, Deserialize)]
struct WireIncludes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl WireError {
    fn describe(self) -> String {
        match (self.title, self.detail, self.message) {
            (Some(title), Some(detail), _) => format!("{title}: {detail}"),
            (Some(title), None, _) => title,
            (None, Some(detail), _) => detail,
            (None, None, Some(message)) => message,
            (None, None, None) => "unknown error".to_string(),
        }
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Decode a raw frame into a [`StreamEvent`]
///
/// # Errors
///
/// - [`DecodeError::Json`] if the frame is not a valid event object
/// - [`DecodeError::Remote`] if the frame is an error object with no event
pub fn decode(frame: &[u8]) -> Result<StreamEvent, DecodeError> {
    let envelope: WireEnvelope =
        serde_json::from_slice(frame).map_err(|e| DecodeError::json(e, frame))?;

    let Some(tweet) = envelope.data else {
        let messages = envelope
            .errors
            .into_iter()
            .map(WireError::describe)
            .collect::<Vec<_>>();
        if messages.is_empty() {
            let source: serde_json::Error = de::Error::missing_field("data");
            return Err(DecodeError::json(source, frame));
        }
        return Err(DecodeError::Remote { messages });
    };

    let included_users = envelope
        .includes
        .users
        .into_iter()
        .map(|user| (user.id.clone(), user))
        .collect();

    Ok(StreamEvent {
        id: tweet.id,
        text: tweet.text,
        author_id: tweet.author_id,
        created_at: tweet.created_at,
        lang: tweet.lang.filter(|lang| !lang.is_empty()),
        matching_rules: envelope.matching_rules,
        included_users,
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct IdVisitor;

    impl Visitor<'_> for IdVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or integer id")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}
