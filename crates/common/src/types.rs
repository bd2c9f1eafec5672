// Core domain types shared across all chatlog crates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-assigned message identifier. Strictly increasing in creation order.
pub type MessageId = i64;

/// Delivery of one message to one repository target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Committed { commit_id: String },
    Failed { reason: String, retry_count: u32 },
}

impl DeliveryState {
    /// Short label, also the value stored in the `deliveries.state` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed { .. } => "committed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// Pending and failed deliveries are both eligible for the next sync.
    pub fn needs_sync(&self) -> bool {
        !self.is_committed()
    }

    pub fn commit_id(&self) -> Option<&str> {
        match self {
            Self::Committed { commit_id } => Some(commit_id),
            _ => None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Failed { retry_count, .. } => *retry_count,
            _ => 0,
        }
    }
}

/// A posted message with its per-target delivery annotations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Keyed by target name.
    #[serde(default)]
    pub deliveries: BTreeMap<String, DeliveryState>,
}

impl Message {
    pub fn delivery(&self, target: &str) -> Option<&DeliveryState> {
        self.deliveries.get(target)
    }

    /// True once every known target holds a commit for this message.
    pub fn fully_delivered(&self) -> bool {
        self.deliveries.values().all(DeliveryState::is_committed)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content must not be empty")]
    EmptyContent,

    #[error("message content exceeds maximum length of {max} bytes (got {len})")]
    TooLong { max: usize, len: usize },
}

/// Upper bound on a single message body.
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// Check that `content` is acceptable. The text is stored as given; trimming
/// only decides emptiness.
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(ValidationError::TooLong { max: MAX_CONTENT_BYTES, len: content.len() });
    }
    Ok(())
}
