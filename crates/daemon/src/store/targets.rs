// Target registration, cursors, and health counters.

use anyhow::Context;
use chatlog_common::types::MessageId;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use super::{now_text, parse_timestamp, MessageStore, StoreError};
use crate::sync::target::{TargetHealth, TargetRecord, TargetSpec};

/// What `register_target` changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetRegistration {
    pub created: bool,
    /// Destination changed since the last registration.
    pub reconfigured: bool,
    /// Existing messages that gained a pending delivery.
    pub backfilled: usize,
}

const TARGET_COLUMNS: &str = "name, owner, repo, branch, path_prefix, cursor, consecutive_failures, \
     suspended, suspended_reason, last_attempt_at, last_success_at, last_error";

impl MessageStore {
    /// Insert or refresh a target. Messages the target has never seen get a
    /// pending delivery.
    ///
    /// A changed destination is a new repository as far as delivery goes:
    /// every delivery for the target returns to pending, the cursor is
    /// cleared, and suspension and the failure counter are reset.
    pub fn register_target(&self, spec: &TargetSpec) -> Result<TargetRegistration, StoreError> {
        let fingerprint = spec.fingerprint();
        let now = now_text();

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to start target registration")?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT fingerprint FROM sync_targets WHERE name = ?1",
                params![spec.name],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up target")?;

        let (created, reconfigured) = match existing.as_deref() {
            None => {
                tx.execute(
                    "INSERT INTO sync_targets (name, owner, repo, branch, path_prefix, fingerprint) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![spec.name, spec.owner, spec.repo, spec.branch, spec.path_prefix, fingerprint],
                )
                .context("failed to insert target")?;
                (true, false)
            }
            Some(current) if current == fingerprint => (false, false),
            Some(_) => {
                tx.execute(
                    "UPDATE sync_targets SET owner = ?2, repo = ?3, branch = ?4, path_prefix = ?5, \
                     fingerprint = ?6, cursor = NULL, consecutive_failures = 0, suspended = 0, \
                     suspended_reason = NULL, last_error = NULL WHERE name = ?1",
                    params![spec.name, spec.owner, spec.repo, spec.branch, spec.path_prefix, fingerprint],
                )
                .context("failed to update target")?;
                let reset = tx
                    .execute(
                        "UPDATE deliveries SET state = 'pending', commit_id = NULL, reason = NULL, \
                         retry_count = 0, updated_at = ?2 WHERE target = ?1",
                        params![spec.name, now],
                    )
                    .context("failed to reset deliveries for reconfigured target")?;
                info!(
                    target_name = %spec.name,
                    repo = %spec.full_name(),
                    reset,
                    "target destination changed; deliveries reset to pending"
                );
                (false, true)
            }
        };

        let backfilled = tx
            .execute(
                "INSERT OR IGNORE INTO deliveries (message_id, target, state, updated_at) \
                 SELECT id, ?1, 'pending', ?2 FROM messages",
                params![spec.name, now],
            )
            .context("failed to backfill deliveries")?;
        tx.commit().context("failed to commit target registration")?;

        if created || reconfigured || backfilled > 0 {
            info!(
                target_name = %spec.name,
                repo = %spec.full_name(),
                created,
                reconfigured,
                backfilled,
                "registered sync target"
            );
        }
        Ok(TargetRegistration { created, reconfigured, backfilled })
    }

    pub fn target_record(&self, name: &str) -> Result<TargetRecord, StoreError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {TARGET_COLUMNS} FROM sync_targets WHERE name = ?1"),
            params![name],
            row_to_record,
        )
        .optional()
        .context("failed to load target")?
        .ok_or_else(|| StoreError::UnknownTarget(name.to_string()))
    }

    /// All registered targets, by name.
    pub fn target_records(&self) -> Result<Vec<TargetRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {TARGET_COLUMNS} FROM sync_targets ORDER BY name ASC"))
            .context("failed to prepare target listing")?;
        let records = stmt
            .query_map([], row_to_record)
            .context("failed to list targets")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode targets")?;
        Ok(records)
    }

    /// Move the cursor forward. Returns `false` when `cursor` is not ahead
    /// of the stored value.
    pub fn save_cursor(&self, name: &str, cursor: MessageId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE sync_targets SET cursor = ?2 \
                 WHERE name = ?1 AND (cursor IS NULL OR cursor < ?2)",
                params![name, cursor],
            )
            .context("failed to save cursor")?;
        Ok(changed > 0)
    }

    pub fn record_success(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let at = at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        self.update_target(
            name,
            "UPDATE sync_targets SET consecutive_failures = 0, last_error = NULL, \
             last_attempt_at = ?2, last_success_at = ?2 WHERE name = ?1",
            &at,
        )
    }

    pub fn record_failure(&self, name: &str, error: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let at = at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE sync_targets SET consecutive_failures = consecutive_failures + 1, \
                 last_error = ?2, last_attempt_at = ?3 WHERE name = ?1",
                params![name, error, at],
            )
            .context("failed to record target failure")?;
        if changed == 0 {
            return Err(StoreError::UnknownTarget(name.to_string()));
        }
        Ok(())
    }

    /// Stop all attempts for `name` until `resume` or a reconfiguration.
    pub fn suspend(&self, name: &str, reason: &str) -> Result<(), StoreError> {
        self.update_target(
            name,
            "UPDATE sync_targets SET suspended = 1, suspended_reason = ?2 WHERE name = ?1",
            reason,
        )
    }

    /// Clear suspension and the failure counter.
    pub fn resume(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE sync_targets SET suspended = 0, suspended_reason = NULL, \
                 consecutive_failures = 0 WHERE name = ?1",
                params![name],
            )
            .context("failed to resume target")?;
        if changed == 0 {
            return Err(StoreError::UnknownTarget(name.to_string()));
        }
        Ok(())
    }

    fn update_target(&self, name: &str, sql: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let changed = conn.execute(sql, params![name, value]).context("failed to update target")?;
        if changed == 0 {
            return Err(StoreError::UnknownTarget(name.to_string()));
        }
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TargetRecord> {
    let optional_time = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        row.get::<_, Option<String>>(idx)?.as_deref().map(parse_timestamp).transpose()
    };

    Ok(TargetRecord {
        spec: TargetSpec {
            name: row.get(0)?,
            owner: row.get(1)?,
            repo: row.get(2)?,
            branch: row.get(3)?,
            path_prefix: row.get(4)?,
        },
        cursor: row.get(5)?,
        health: TargetHealth {
            consecutive_failures: row.get(6)?,
            suspended: row.get::<_, i64>(7)? != 0,
            suspended_reason: row.get(8)?,
            last_attempt_at: optional_time(9)?,
            last_success_at: optional_time(10)?,
            last_error: row.get(11)?,
        },
    })
}
