// Remote repository boundary: the only way the engine touches a remote.
//
// Implementations receive a fully rendered batch (paths, contents, commit
// message, idempotency key) and report a commit id per file.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use super::error::CommitError;
use super::target::TargetSpec;

/// One file written by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Repository-relative path.
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub files: Vec<FileChange>,
    pub message: String,
    /// Same value for every retry of the same batch.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Applied { commit_id: String },
    /// Carries the classified failure so the engine can tell auth from
    /// transient trouble per file.
    Failed { error: CommitError },
}

/// Result of a commit call that reached the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Commit holding the last applied file.
    pub commit_id: String,
    /// Per-path results. Paths absent here were applied in `commit_id`.
    pub files: BTreeMap<String, FileOutcome>,
}

impl CommitReceipt {
    /// Every file landed in one commit.
    pub fn single(commit_id: impl Into<String>) -> Self {
        Self { commit_id: commit_id.into(), files: BTreeMap::new() }
    }

    pub fn outcome_for(&self, path: &str) -> FileOutcome {
        self.files
            .get(path)
            .cloned()
            .unwrap_or_else(|| FileOutcome::Applied { commit_id: self.commit_id.clone() })
    }
}

/// Commits rendered batches to a remote repository. Trait-based so the
/// engine can run against scripted clients in tests.
pub trait RemoteRepositoryClient: Send + Sync {
    fn commit(
        &self,
        target: &TargetSpec,
        request: CommitRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CommitReceipt, CommitError>> + Send>>;
}
