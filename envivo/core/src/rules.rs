//! Rule Client
//!
//! Manages the persistent filter rules of the stream: list, add (optionally
//! as a dry run), delete by id, and delete everything.
//!
//! Rule files use the request body format of the rules endpoint:
//!
//! ```json
//! {"add": [{"value": "cat has:images", "tag": "cats with images"}]}
//! ```

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{error_body, FeedClient};
use crate::error::ConfigError;

// ============================================================================
// Errors
// ============================================================================

/// Errors from the rules endpoint
#[derive(Debug, Error)]
pub enum RuleError {
    /// Invalid input, detected before any request
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The request could not be sent or the response not read
    #[error("rules request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status
    #[error("rules endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The response body did not have the expected shape
    #[error("unexpected rules response ({source}): {body}")]
    Decode {
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
        /// Response body
        body: String,
    },
}

// ============================================================================
// Wire types
// ============================================================================

/// A persisted rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id
    pub id: String,
    /// Rule expression
    pub value: String,
    /// Optional label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// A rule to create
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRule {
    /// Rule expression
    pub value: String,
    /// Optional label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Body of an add request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRulesRequest {
    /// Rules to create
    pub add: Vec<NewRule>,
}

#[derive(Serialize)]
struct DeleteRulesRequest<'a> {
    delete: DeleteIds<'a>,
}

#[derive(Serialize)]
struct DeleteIds<'a> {
    ids: &'a [String],
}

/// Response metadata for a rules listing
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRulesMeta {
    /// When the response was sent
    #[serde(default)]
    pub sent: String,
    /// Number of rules returned
    #[serde(default)]
    pub result_count: u64,
}

/// Response of a rules listing
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRulesResponse {
    /// Current rules
    #[serde(default)]
    pub data: Vec<Rule>,
    /// Metadata
    #[serde(default)]
    pub meta: FetchRulesMeta,
}

/// Counts reported after an add
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRulesSummary {
    /// Rules created
    #[serde(default)]
    pub created: u64,
    /// Rules rejected
    #[serde(default)]
    pub not_created: u64,
}

/// Response metadata for an add
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRulesMeta {
    /// When the response was sent
    #[serde(default)]
    pub sent: String,
    /// Counts
    #[serde(default)]
    pub summary: AddRulesSummary,
}

/// Response of an add
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddRulesResponse {
    /// Rules created (or that would be, for a dry run)
    #[serde(default)]
    pub data: Vec<Rule>,
    /// Metadata
    #[serde(default)]
    pub meta: AddRulesMeta,
    /// Per-rule errors reported by the remote
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<serde_json::Value>,
}

/// Counts reported after a delete
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRulesSummary {
    /// Rules deleted
    #[serde(default)]
    pub deleted: u64,
    /// Rules that could not be deleted
    #[serde(default)]
    pub not_deleted: u64,
}

/// Response metadata for a delete
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRulesMeta {
    /// When the response was sent
    #[serde(default)]
    pub sent: String,
    /// Counts
    #[serde(default)]
    pub summary: DeleteRulesSummary,
}

/// Response of a delete
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRulesResponse {
    /// Metadata
    #[serde(default)]
    pub meta: DeleteRulesMeta,
}

// ============================================================================
// Client
// ============================================================================

/// Client for the rules endpoint
#[derive(Clone, Debug)]
pub struct RuleClient {
    client: FeedClient,
}

impl RuleClient {
    /// Wrap an authenticated feed client
    #[must_use]
    pub fn new(client: FeedClient) -> Self {
        Self { client }
    }

    /// List the current rules
    ///
    /// # Errors
    ///
    /// [`RuleError`] on transport failure, error status or unexpected body.
    pub async fn fetch_rules(&self) -> Result<FetchRulesResponse, RuleError> {
        let response = self
            .client
            .http()
            .get(self.client.rules_url())
            .send()
            .await?;
        let rules: FetchRulesResponse = read_json(response).await?;
        debug!(count = rules.data.len(), "Fetched rules");
        Ok(rules)
    }

    /// Add rules; a dry run validates without persisting
    ///
    /// # Errors
    ///
    /// [`RuleError`] on transport failure, error status or unexpected body.
    pub async fn add_rules(
        &self,
        request: &AddRulesRequest,
        dry_run: bool,
    ) -> Result<AddRulesResponse, RuleError> {
        let mut builder = self.client.http().post(self.client.rules_url());
        if dry_run {
            builder = builder.query(&[("dry_run", "true")]);
        }
        let response = builder.json(request).send().await?;
        let added: AddRulesResponse = read_json(response).await?;
        info!(
            dry_run,
            created = added.meta.summary.created,
            not_created = added.meta.summary.not_created,
            "Rules submitted"
        );
        Ok(added)
    }

    /// Delete rules by id
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyDeleteIds`] (wrapped) for an empty id list, before
    /// any request is made; otherwise [`RuleError`] on failure.
    pub async fn delete_rules(&self, ids: &[String]) -> Result<DeleteRulesResponse, RuleError> {
        if ids.is_empty() {
            return Err(ConfigError::EmptyDeleteIds.into());
        }
        let body = DeleteRulesRequest {
            delete: DeleteIds { ids },
        };
        let response = self
            .client
            .http()
            .post(self.client.rules_url())
            .json(&body)
            .send()
            .await?;
        let deleted: DeleteRulesResponse = read_json(response).await?;
        info!(
            deleted = deleted.meta.summary.deleted,
            not_deleted = deleted.meta.summary.not_deleted,
            "Rules deleted"
        );
        Ok(deleted)
    }

    /// Delete every current rule
    ///
    /// Returns `None` without issuing a delete when there are no rules.
    ///
    /// # Errors
    ///
    /// [`RuleError`] from either the listing or the delete.
    pub async fn delete_all_rules(&self) -> Result<Option<DeleteRulesResponse>, RuleError> {
        let current = self.fetch_rules().await?;
        if current.data.is_empty() {
            info!("No rules to delete");
            return Ok(None);
        }
        let ids: Vec<String> = current.data.into_iter().map(|rule| rule.id).collect();
        self.delete_rules(&ids).await.map(Some)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RuleError> {
    let status = response.status();
    if !status.is_success() {
        return Err(RuleError::Status {
            status: status.as_u16(),
            body: error_body(response).await,
        });
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|source| RuleError::Decode { source, body })
}

/// Read an add request from a JSON rules file
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read,
/// [`ConfigError::RulesFile`] if it is not a valid add request.
pub fn load_rules_file(path: &Path) -> Result<AddRulesRequest, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::RulesFile {
        path: path.display().to_string(),
        source,
    })
}
