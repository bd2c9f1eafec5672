// Message cache operations: append, listing, and per-target delivery state.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use chatlog_common::types::{validate_content, DeliveryState, Message, MessageId};
use chrono::{SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_text, parse_timestamp, MessageStore, StoreError};

/// Result of recording a commit for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Pending or failed became committed.
    Applied,
    /// Already committed with the same commit id.
    Unchanged,
}

impl MessageStore {
    /// Validate and persist a new message. Every registered target gets a
    /// pending delivery in the same transaction.
    pub fn append(&self, content: &str) -> Result<Message, StoreError> {
        validate_content(content)?;

        let created_at = Utc::now().trunc_subsecs(6);
        let created_text = created_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to start append transaction")?;
        tx.execute(
            "INSERT INTO messages (content, created_at) VALUES (?1, ?2)",
            params![content, created_text],
        )
        .context("failed to insert message")?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO deliveries (message_id, target, state, updated_at) \
             SELECT ?1, name, 'pending', ?2 FROM sync_targets",
            params![id, created_text],
        )
        .context("failed to create pending deliveries")?;

        let deliveries = {
            let mut stmt = tx
                .prepare("SELECT target FROM deliveries WHERE message_id = ?1")
                .context("failed to prepare delivery lookup")?;
            let targets = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))
                .context("failed to read new deliveries")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to decode new deliveries")?;
            targets.into_iter().map(|t| (t, DeliveryState::Pending)).collect()
        };
        tx.commit().context("failed to commit append transaction")?;

        Ok(Message { id, content: content.to_string(), created_at, deliveries })
    }

    /// Messages with id greater than `since` (all when `None`), ascending,
    /// annotated with every target's delivery state.
    pub fn list(&self, since: Option<MessageId>) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn();
        let floor = since.unwrap_or(0);
        let mut stmt = conn
            .prepare("SELECT id, content, created_at FROM messages WHERE id > ?1 ORDER BY id ASC")
            .context("failed to prepare message listing")?;
        let mut messages = stmt
            .query_map(params![floor], row_to_message)
            .context("failed to list messages")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode messages")?;

        let mut deliveries = deliveries_after(&conn, floor)?;
        for message in &mut messages {
            if let Some(states) = deliveries.remove(&message.id) {
                message.deliveries = states;
            }
        }
        Ok(messages)
    }

    pub fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let conn = self.conn();
        let message = conn
            .query_row(
                "SELECT id, content, created_at FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )
            .optional()
            .context("failed to load message")?;
        let Some(mut message) = message else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT message_id, target, state, commit_id, reason, retry_count \
                 FROM deliveries WHERE message_id = ?1",
            )
            .context("failed to prepare delivery lookup")?;
        let rows = stmt
            .query_map(params![id], row_to_delivery)
            .context("failed to read deliveries")?;
        for row in rows {
            let (_, target, state) = row.context("failed to decode delivery")?;
            message.deliveries.insert(target, state);
        }
        Ok(Some(message))
    }

    /// Up to `limit` messages still owed to `target` (pending or failed),
    /// ascending by id. Only that target's delivery is attached.
    pub fn pending_for(&self, target: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.content, m.created_at, d.state, d.commit_id, d.reason, d.retry_count \
                 FROM deliveries d JOIN messages m ON m.id = d.message_id \
                 WHERE d.target = ?1 AND d.state != 'committed' \
                 ORDER BY m.id ASC LIMIT ?2",
            )
            .context("failed to prepare pending query")?;
        let rows = stmt
            .query_map(params![target, limit], |row| {
                let mut message = row_to_message(row)?;
                let state = delivery_state_from(row, 3)?;
                message.deliveries.insert(target.to_string(), state);
                Ok(message)
            })
            .context("failed to query pending messages")?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to decode pending messages")?)
    }

    pub fn pending_count(&self, target: &str) -> Result<u64, StoreError> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM deliveries WHERE target = ?1 AND state != 'committed'",
                params![target],
                |row| row.get(0),
            )
            .context("failed to count pending deliveries")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Record that `message_id` landed on `target` in `commit_id`.
    ///
    /// Re-marking with the same commit id is a no-op. A committed delivery
    /// never changes commit id.
    pub fn mark_delivered(
        &self,
        target: &str,
        message_id: MessageId,
        commit_id: &str,
    ) -> Result<MarkOutcome, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to start mark_delivered transaction")?;
        let existing = load_state(&tx, target, message_id)?;
        let outcome = match existing {
            None => {
                return Err(StoreError::UnknownDelivery {
                    target: target.to_string(),
                    message_id,
                })
            }
            Some(DeliveryState::Committed { commit_id: current }) if current == commit_id => {
                MarkOutcome::Unchanged
            }
            Some(existing @ DeliveryState::Committed { .. }) => {
                return Err(StoreError::InvalidTransition {
                    target: target.to_string(),
                    message_id,
                    existing,
                    attempted: DeliveryState::Committed { commit_id: commit_id.to_string() },
                })
            }
            Some(_) => {
                tx.execute(
                    "UPDATE deliveries SET state = 'committed', commit_id = ?3, reason = NULL, \
                     updated_at = ?4 WHERE message_id = ?1 AND target = ?2",
                    params![message_id, target, commit_id, now_text()],
                )
                .context("failed to mark delivery committed")?;
                MarkOutcome::Applied
            }
        };
        tx.commit().context("failed to commit mark_delivered transaction")?;
        Ok(outcome)
    }

    /// Record a failed attempt. Returns `false` without touching the row
    /// when the delivery is already committed.
    pub fn mark_failed(
        &self,
        target: &str,
        message_id: MessageId,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE deliveries SET state = 'failed', reason = ?3, retry_count = retry_count + 1, \
                 updated_at = ?4 WHERE message_id = ?1 AND target = ?2 AND state != 'committed'",
                params![message_id, target, reason, now_text()],
            )
            .context("failed to mark delivery failed")?;
        if changed > 0 {
            return Ok(true);
        }
        match load_state(&conn, target, message_id)? {
            Some(_) => Ok(false),
            None => Err(StoreError::UnknownDelivery { target: target.to_string(), message_id }),
        }
    }

    pub fn delivery_state(
        &self,
        target: &str,
        message_id: MessageId,
    ) -> Result<Option<DeliveryState>, StoreError> {
        load_state(&self.conn(), target, message_id)
    }

    /// Delivery states for `target` with id strictly greater than `after`,
    /// ascending, at most `limit` rows.
    pub fn delivery_states_after(
        &self,
        target: &str,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<(MessageId, DeliveryState)>, StoreError> {
        let conn = self.conn();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn
            .prepare(
                "SELECT message_id, target, state, commit_id, reason, retry_count FROM deliveries \
                 WHERE target = ?1 AND message_id > ?2 ORDER BY message_id ASC LIMIT ?3",
            )
            .context("failed to prepare delivery scan")?;
        let rows = stmt
            .query_map(params![target, after.unwrap_or(0), limit], row_to_delivery)
            .context("failed to scan deliveries")?;
        let mut states = Vec::new();
        for row in rows {
            let (id, _, state) = row.context("failed to decode delivery")?;
            states.push((id, state));
        }
        Ok(states)
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let created_at: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        content: row.get(1)?,
        created_at: parse_timestamp(&created_at)?,
        deliveries: BTreeMap::new(),
    })
}

fn row_to_delivery(row: &Row<'_>) -> rusqlite::Result<(MessageId, String, DeliveryState)> {
    Ok((row.get(0)?, row.get(1)?, delivery_state_from(row, 2)?))
}

/// Decode `state, commit_id, reason, retry_count` starting at column `start`.
fn delivery_state_from(row: &Row<'_>, start: usize) -> rusqlite::Result<DeliveryState> {
    let state: String = row.get(start)?;
    match state.as_str() {
        "pending" => Ok(DeliveryState::Pending),
        "committed" => {
            Ok(DeliveryState::Committed { commit_id: row.get::<_, Option<String>>(start + 1)?.unwrap_or_default() })
        }
        "failed" => Ok(DeliveryState::Failed {
            reason: row.get::<_, Option<String>>(start + 2)?.unwrap_or_default(),
            retry_count: row.get(start + 3)?,
        }),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            start,
            rusqlite::types::Type::Text,
            format!("unknown delivery state `{other}`").into(),
        )),
    }
}

fn load_state(
    conn: &Connection,
    target: &str,
    message_id: MessageId,
) -> Result<Option<DeliveryState>, StoreError> {
    let state = conn
        .query_row(
            "SELECT state, commit_id, reason, retry_count FROM deliveries \
             WHERE message_id = ?1 AND target = ?2",
            params![message_id, target],
            |row| delivery_state_from(row, 0),
        )
        .optional()
        .context("failed to load delivery state")?;
    Ok(state)
}

fn deliveries_after(
    conn: &Connection,
    floor: MessageId,
) -> Result<HashMap<MessageId, BTreeMap<String, DeliveryState>>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT message_id, target, state, commit_id, reason, retry_count \
             FROM deliveries WHERE message_id > ?1",
        )
        .context("failed to prepare delivery listing")?;
    let rows = stmt.query_map(params![floor], row_to_delivery).context("failed to list deliveries")?;

    let mut by_message: HashMap<MessageId, BTreeMap<String, DeliveryState>> = HashMap::new();
    for row in rows {
        let (id, target, state) = row.context("failed to decode delivery")?;
        by_message.entry(id).or_default().insert(target, state);
    }
    Ok(by_message)
}
