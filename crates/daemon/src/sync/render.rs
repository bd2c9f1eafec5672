// Batch rendering: file layout, commit message, and idempotency key.
//
// Paths are deterministic in the message ids, so a retried batch writes to
// the same files.

use chatlog_common::path::join_repo_path;
use chatlog_common::types::{Message, MessageId};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::remote::{CommitRequest, FileChange};
use super::target::{hex, TargetSpec};
use crate::config::CommitStrategy;

/// A file plus the messages it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub change: FileChange,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBatch {
    pub files: Vec<RenderedFile>,
    pub message: String,
    pub idempotency_key: String,
}

impl RenderedBatch {
    pub fn request(&self) -> CommitRequest {
        CommitRequest {
            files: self.files.iter().map(|f| f.change.clone()).collect(),
            message: self.message.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

/// Render `batch` (ascending ids) for `target`.
pub fn render_batch(target: &TargetSpec, batch: &[Message], strategy: CommitStrategy) -> RenderedBatch {
    let min = batch.first().map_or(0, |m| m.id);
    let max = batch.last().map_or(0, |m| m.id);

    let files = match strategy {
        CommitStrategy::OneFilePerMessage => batch
            .iter()
            .map(|message| RenderedFile {
                change: FileChange {
                    path: join_repo_path(&target.path_prefix, &message_file_name(message)),
                    content: message.content.clone(),
                },
                message_ids: vec![message.id],
            })
            .collect(),
        CommitStrategy::AggregatedFile if batch.is_empty() => Vec::new(),
        CommitStrategy::AggregatedFile => vec![RenderedFile {
            change: FileChange {
                path: join_repo_path(&target.path_prefix, &format!("messages_{min}_{max}.jsonl")),
                content: jsonl(batch),
            },
            message_ids: batch.iter().map(|m| m.id).collect(),
        }],
    };

    RenderedBatch {
        files,
        message: commit_message(min, max),
        idempotency_key: idempotency_key(&target.name, min, max),
    }
}

/// `{YYYYmmdd_HHMMSS}_{id}.txt`
pub fn message_file_name(message: &Message) -> String {
    format!("{}_{}.txt", message.created_at.format("%Y%m%d_%H%M%S"), message.id)
}

pub fn commit_message(min: MessageId, max: MessageId) -> String {
    if min == max {
        format!("Add message {min}")
    } else {
        format!("Add messages {min}-{max}")
    }
}

/// Hex SHA-256 of `{target}:{min}:{max}`.
pub fn idempotency_key(target: &str, min: MessageId, max: MessageId) -> String {
    hex(&Sha256::digest(format!("{target}:{min}:{max}").as_bytes()))
}

fn jsonl(batch: &[Message]) -> String {
    let mut out = String::new();
    for message in batch {
        let line = json!({
            "id": message.id,
            "content": message.content,
            "created_at": message.created_at.to_rfc3339(),
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}
