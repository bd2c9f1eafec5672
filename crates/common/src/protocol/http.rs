// JSON bodies for the daemon's HTTP endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Message, MessageId};

/// `POST /messages` request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateMessageRequest {
    pub content: String,
}

/// `POST /messages` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub status: PushStatus,
    pub message: Message,
}

/// `GET /messages` query string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListMessagesQuery {
    pub since: Option<MessageId>,
}

/// `GET /messages` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagesPage {
    pub messages: Vec<Message>,
}

/// Aggregate status reported by `/push` (and reused as the generic `status` field).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Success,
    Partial,
    Error,
}

impl PushStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }
}

/// Summary of one target's run inside a push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    /// `noop`, `committed`, `partial`, `failed`, `skipped`, or `engine_error`.
    pub outcome: String,
    pub batch: Vec<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    pub cursor: Option<MessageId>,
    pub pending: u64,
    #[serde(default)]
    pub coalesced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /push` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushResponse {
    pub status: PushStatus,
    pub message: String,
    pub results: BTreeMap<String, RunSummary>,
}

/// One entry of `GET /targets`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetStatus {
    pub name: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub path_prefix: String,
    pub cursor: Option<MessageId>,
    pub healthy: bool,
    pub suspended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_reason: Option<String>,
    pub consecutive_failures: u32,
    pub pending: u64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetsEnvelope {
    pub targets: Vec<TargetStatus>,
}

/// Error body shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub status: PushStatus,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_status_uses_snake_case() {
        assert_eq!(serde_json::to_string(&PushStatus::Partial).unwrap(), "\"partial\"");
        assert_eq!(PushStatus::Error.as_str(), "error");
    }

    #[test]
    fn list_query_defaults_to_everything() {
        let query: ListMessagesQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.since, None);
    }

    #[test]
    fn run_summary_omits_absent_fields() {
        let summary = RunSummary {
            outcome: "noop".into(),
            batch: vec![],
            commit_id: None,
            cursor: None,
            pending: 0,
            coalesced: false,
            error: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("commit_id").is_none());
        assert!(json.get("error").is_none());
        assert!(json["cursor"].is_null());
    }
}
