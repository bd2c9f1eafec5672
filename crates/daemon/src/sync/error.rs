// Failure taxonomy for remote commits and sync runs.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a `RemoteRepositoryClient`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommitError {
    /// Network trouble or a 5xx. Safe to retry.
    #[error("transient remote failure: {reason}")]
    Transient { reason: String },

    #[error("rate limited by remote{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials rejected or lacking permission.
    #[error("remote rejected credentials: {reason}")]
    Auth { reason: String },

    /// The request was sent but no answer arrived; it may have been applied.
    #[error("remote result unknown: {reason}")]
    Ambiguous { reason: String },

    /// Misconfiguration the remote will keep rejecting (missing repo/branch).
    #[error("remote rejected request permanently: {reason}")]
    Fatal { reason: String },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default()
}

/// How the engine classifies a failed run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Retried on the next sweep with the cursor unchanged.
    #[error("{reason}")]
    Transient { reason: String },

    /// Target suspended until an operator resumes or reconfigures it.
    #[error("{reason}")]
    Auth { reason: String },

    /// Treated as transient; a retry may duplicate the commit if the
    /// remote ignores the idempotency key.
    #[error("{reason} (idempotency key {idempotency_key})")]
    Ambiguous { reason: String, idempotency_key: String },
}

impl SyncError {
    pub fn from_commit(error: &CommitError, idempotency_key: &str) -> Self {
        let reason = error.to_string();
        match error {
            CommitError::Transient { .. } | CommitError::RateLimited { .. } => {
                Self::Transient { reason }
            }
            CommitError::Auth { .. } | CommitError::Fatal { .. } => Self::Auth { reason },
            CommitError::Ambiguous { .. } => {
                Self::Ambiguous { reason, idempotency_key: idempotency_key.to_string() }
            }
        }
    }

    /// Auth-class failures stop further attempts for the target.
    pub fn suspends_target(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Auth { .. } => "auth",
            Self::Ambiguous { .. } => "ambiguous",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_commit_errors() {
        let key = "k";
        let transient = CommitError::Transient { reason: "503".into() };
        assert_eq!(SyncError::from_commit(&transient, key).kind(), "transient");

        let limited = CommitError::RateLimited { retry_after: Some(Duration::from_secs(60)) };
        let sync = SyncError::from_commit(&limited, key);
        assert!(!sync.suspends_target());
        assert!(sync.to_string().contains("retry after 60s"));

        let fatal = CommitError::Fatal { reason: "repo not found".into() };
        assert!(SyncError::from_commit(&fatal, key).suspends_target());

        let auth = CommitError::Auth { reason: "bad credentials".into() };
        assert!(SyncError::from_commit(&auth, key).suspends_target());
    }

    #[test]
    fn ambiguous_keeps_idempotency_key() {
        let error = CommitError::Ambiguous { reason: "timed out".into() };
        let sync = SyncError::from_commit(&error, "abc123");
        assert_eq!(
            sync,
            SyncError::Ambiguous {
                reason: "remote result unknown: timed out".into(),
                idempotency_key: "abc123".into()
            }
        );
        assert!(!sync.suspends_target());
    }
}
