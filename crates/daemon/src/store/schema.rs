use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE sync_targets (
    name                    TEXT PRIMARY KEY,
    owner                   TEXT NOT NULL,
    repo                    TEXT NOT NULL,
    branch                  TEXT NOT NULL,
    path_prefix             TEXT NOT NULL,
    fingerprint             TEXT NOT NULL,
    cursor                  INTEGER NULL,
    consecutive_failures    INTEGER NOT NULL DEFAULT 0,
    suspended               INTEGER NOT NULL DEFAULT 0,
    suspended_reason        TEXT NULL,
    last_attempt_at         TEXT NULL,
    last_success_at         TEXT NULL,
    last_error              TEXT NULL
);

CREATE TABLE deliveries (
    message_id  INTEGER NOT NULL REFERENCES messages (id),
    target      TEXT NOT NULL REFERENCES sync_targets (name),
    state       TEXT NOT NULL CHECK (state IN ('pending', 'committed', 'failed')),
    commit_id   TEXT NULL,
    reason      TEXT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (message_id, target)
);

CREATE INDEX deliveries_target_state_idx
    ON deliveries (target, state, message_id);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// Open (creating if needed) the message database and bring its schema up to date.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create message db parent directory `{}`", parent.display())
        })?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open message db at `{}`", path.display()))?;
    prepare(conn)
}

/// In-memory database with the full schema. Used by tests and dry runs.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory message db")?;
    prepare(conn)
}

fn prepare(mut conn: Connection) -> Result<Connection> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        ",
    )
    .context("failed to configure sqlite pragmas for message db")?;

    ensure_migration_table(&conn)?;
    apply_pending_migrations(&mut conn)?;
    Ok(conn)
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

pub fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply message db migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
