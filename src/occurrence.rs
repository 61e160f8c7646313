//! Occurrence and error-identity records shared by every analytics component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of an error identity (a deduplicated group of occurrences).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One observed exception, already assigned to an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub error_type: String,
    pub platform: String,
    pub message: String,
    pub backtrace: Vec<String>,
    pub occurred_at: DateTime<Utc>,
    pub error_identity_id: IdentityId,
}

/// A raw exception as captured by an SDK, before identity assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOccurrence {
    pub error_type: String,
    pub platform: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub backtrace: Option<Vec<String>>,
    pub occurred_at: DateTime<Utc>,
}

/// Aggregate view of an identity as kept by the storage collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorIdentity {
    pub id: IdentityId,
    pub error_type: String,
    pub platform: String,
    pub normalized_message: String,
    pub backtrace_signature: Option<String>,
    pub occurrence_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// An (error_type, platform) partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ErrorKey {
    pub error_type: String,
    pub platform: String,
}

impl ErrorKey {
    pub fn new(error_type: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            platform: platform.into(),
        }
    }
}

impl std::fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.error_type, self.platform)
    }
}
