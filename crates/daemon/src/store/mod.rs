// Persistence: SQLite message cache with per-target delivery state.
//
// One connection behind a mutex. Every operation locks, runs a short
// statement or transaction, and releases; callers never hold the lock
// across an await.
//
// The mutex only serialises individual statements. Rows are keyed by
// (target, message id), so no statement touches another target's state,
// and a target's remote call runs with the lock released. A stalled or
// failing target therefore never blocks appends or other targets.

pub mod messages;
pub mod schema;
pub mod targets;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chatlog_common::types::{DeliveryState, MessageId, ValidationError};
use rusqlite::Connection;
use thiserror::Error;

pub use messages::MarkOutcome;
pub use targets::TargetRegistration;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(
        "invalid delivery transition for message {message_id} on target `{target}`: \
         {existing:?} -> {attempted:?}"
    )]
    InvalidTransition {
        target: String,
        message_id: MessageId,
        existing: DeliveryState,
        attempted: DeliveryState,
    },

    #[error("no delivery of message {message_id} to target `{target}`")]
    UnknownDelivery { target: String, message_id: MessageId },

    #[error("unknown target `{0}`")]
    UnknownTarget(String),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

/// Durable message cache shared by the HTTP surface and the sync engine.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self { conn: Mutex::new(schema::open_connection(path)?) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self { conn: Mutex::new(schema::open_in_memory()?) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite consistent; keep serving.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn now_text() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(text: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(error))
        })
}
