//! Origin Policy
//!
//! Decides which browser origins may open the relay websocket. Matching is an
//! exact string comparison against the `Origin` request header, so scheme and
//! port are significant.

/// Origin validation policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginPolicy {
    mode: OriginPolicyMode,
    allowed: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OriginPolicyMode {
    /// Any origin, including none (local tooling only)
    AllowAll,
    /// Only listed origins
    AllowList,
}

impl OriginPolicy {
    /// Allow exactly the listed origins
    ///
    /// Entries are trimmed and empty entries are ignored, so a list parsed
    /// from `"a, b,"` yields `["a", "b"]`.
    pub fn new<I, S>(allowed_origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: Vec<String> = Vec::new();
        for origin in allowed_origins {
            let origin = origin.as_ref().trim();
            if !origin.is_empty() && !allowed.iter().any(|o| o == origin) {
                allowed.push(origin.to_string());
            }
        }
        Self {
            mode: OriginPolicyMode::AllowList,
            allowed,
        }
    }

    /// Parse a comma-separated allow-list
    #[must_use]
    pub fn from_comma_list(list: &str) -> Self {
        Self::new(list.split(','))
    }

    /// Allow every origin
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            mode: OriginPolicyMode::AllowAll,
            allowed: Vec::new(),
        }
    }

    /// Validate the `Origin` header of an upgrade request
    #[must_use]
    pub fn validate(&self, origin: Option<&str>) -> OriginValidationResult {
        match (self.mode, origin) {
            (OriginPolicyMode::AllowAll, _) => OriginValidationResult::Allowed,
            (OriginPolicyMode::AllowList, None) => OriginValidationResult::Denied {
                reason: "missing Origin header".to_string(),
            },
            (OriginPolicyMode::AllowList, Some(origin)) => {
                if self.allowed.iter().any(|allowed| allowed == origin) {
                    OriginValidationResult::Allowed
                } else {
                    OriginValidationResult::Denied {
                        reason: format!("origin '{origin}' not in allow list"),
                    }
                }
            }
        }
    }

    /// The configured allow-list
    #[must_use]
    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed
    }

    /// Whether every origin is allowed
    #[must_use]
    pub fn is_allow_all(&self) -> bool {
        self.mode == OriginPolicyMode::AllowAll
    }
}

/// Result of origin validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginValidationResult {
    /// Origin is allowed
    Allowed,
    /// Origin is denied
    Denied {
        /// Reason for denial
        reason: String,
    },
}

impl OriginValidationResult {
    /// Check if the origin is allowed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Get the denial reason if denied
    #[must_use]
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            Self::Denied { reason } => Some(reason),
            Self::Allowed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list_exact_match() {
        let policy = OriginPolicy::new(["http://localhost:8080", "https://app.example.com"]);

        assert!(policy.validate(Some("http://localhost:8080")).is_allowed());
        assert!(policy.validate(Some("https://app.example.com")).is_allowed());
        assert!(!policy.validate(Some("http://localhost:8081")).is_allowed());
        assert!(!policy.validate(Some("https://localhost:8080")).is_allowed()); // Different scheme
        assert!(!policy.validate(Some("https://evil.com")).is_allowed());
    }

    #[test]
    fn test_missing_origin_is_denied() {
        let policy = OriginPolicy::new(["http://localhost:8080"]);
        let result = policy.validate(None);
        assert_eq!(result.denial_reason(), Some("missing Origin header"));
    }

    #[test]
    fn test_comma_list_parsing() {
        let policy = OriginPolicy::from_comma_list(" http://a.test , http://b.test,,http://a.test");
        assert_eq!(
            policy.allowed_origins(),
            &["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }

    #[test]
    fn test_empty_list_denies_everything() {
        let policy = OriginPolicy::from_comma_list("");
        assert!(policy.allowed_origins().is_empty());
        assert!(!policy.validate(Some("http://localhost:8080")).is_allowed());
    }

    #[test]
    fn test_allow_all() {
        let policy = OriginPolicy::allow_all();
        assert!(policy.is_allow_all());
        assert!(policy.validate(Some("https://any.domain.com")).is_allowed());
        assert!(policy.validate(None).is_allowed());
    }
}
