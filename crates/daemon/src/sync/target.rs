// Repository targets, their health bookkeeping, and cursor advancement.

use std::time::Duration;

use chatlog_common::path::{normalize_prefix, PathError};
use chatlog_common::types::{DeliveryState, MessageId};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::config::TargetConfig;

// ── Constants ───────────────────────────────────────────────────────

const BASE_DELAY_MS: u64 = 250;
const MAX_EXPONENT: u32 = 20;

// ── Target spec ─────────────────────────────────────────────────────

/// A named remote destination: repository, branch, and path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub name: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Normalized; empty means the repository root.
    pub path_prefix: String,
}

impl TargetSpec {
    pub fn from_config(config: &TargetConfig) -> Result<Self, PathError> {
        Ok(Self {
            name: config.name.clone(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            branch: config.branch.clone(),
            path_prefix: normalize_prefix(&config.path_prefix)?,
        })
    }

    /// `owner/repo`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Stable digest of everything that decides where files land. A change
    /// means the target was reconfigured.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.owner, &self.repo, &self.branch, &self.path_prefix] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex(&hasher.finalize())
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Health ──────────────────────────────────────────────────────────

/// Persisted health counters for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetHealth {
    pub consecutive_failures: u32,
    pub suspended: bool,
    pub suspended_reason: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TargetHealth {
    /// Healthy means not suspended and under `threshold` consecutive failures.
    pub fn is_healthy(&self, threshold: u32) -> bool {
        !self.suspended && self.consecutive_failures < threshold
    }

    /// Earliest time a scheduled run may retry an unhealthy target.
    ///
    /// `None` when the target is healthy or has never been attempted.
    pub fn retry_not_before(&self, threshold: u32, cap: Duration) -> Option<DateTime<Utc>> {
        if self.consecutive_failures < threshold {
            return None;
        }
        let last_attempt = self.last_attempt_at?;
        let delay = backoff_delay(self.consecutive_failures - threshold, cap);
        let delay = chrono::Duration::from_std(delay).ok()?;
        Some(last_attempt + delay)
    }
}

/// Exponential backoff for the given 0-based attempt: 250ms doubling, capped.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.min(MAX_EXPONENT);
    let delay = Duration::from_millis(BASE_DELAY_MS.saturating_mul(1u64 << exp));
    delay.min(cap)
}

/// A registered target together with its sync position and health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    pub spec: TargetSpec,
    /// Highest id such that it and every earlier message are committed.
    pub cursor: Option<MessageId>,
    pub health: TargetHealth,
}

// ── Cursor ──────────────────────────────────────────────────────────

/// Walk `states` (ascending ids strictly after `cursor`) and return the new
/// cursor: the end of the leading run of committed deliveries.
///
/// The first pending or failed delivery stops the walk, so the cursor never
/// skips a gap even when later messages are already committed.
pub fn advance_cursor_if_contiguous(
    cursor: Option<MessageId>,
    states: &[(MessageId, DeliveryState)],
) -> Option<MessageId> {
    let mut next = cursor;
    for (id, state) in states {
        if next.is_some_and(|current| *id <= current) {
            continue;
        }
        if !state.is_committed() {
            break;
        }
        next = Some(*id);
    }
    next
}
