//! SQLite DDL for the reminder store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Current schema version stamped into `schema_meta`.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    owner          TEXT NOT NULL,
    id             TEXT NOT NULL,
    title          TEXT NOT NULL,
    notes          TEXT NOT NULL DEFAULT '',
    every_days     INTEGER NOT NULL DEFAULT 1,
    schedule_days  TEXT NOT NULL DEFAULT '[]',   -- JSON array of weekday numbers
    next_due       TEXT NOT NULL,                -- YYYY-MM-DD, owner-local
    remind_at      TEXT NOT NULL,                -- HH:MM, owner-local
    priority       INTEGER NOT NULL DEFAULT 0,
    last_completed TEXT,                         -- RFC 3339 UTC
    PRIMARY KEY (owner, id)
);

CREATE TABLE IF NOT EXISTS push_subscriptions (
    owner             TEXT NOT NULL,
    endpoint          TEXT NOT NULL,
    p256dh            TEXT NOT NULL,
    auth              TEXT NOT NULL,
    tz_offset_minutes INTEGER,
    created_at        TEXT NOT NULL,
    PRIMARY KEY (owner, endpoint)
);

CREATE TABLE IF NOT EXISTS owner_profiles (
    owner             TEXT PRIMARY KEY,
    tz_offset_minutes INTEGER
);

-- Idempotency ledger: one row per sent (subject, stage).
CREATE TABLE IF NOT EXISTS notifications_sent (
    subject TEXT NOT NULL,   -- JSON-encoded Subject
    stage   TEXT NOT NULL,   -- JSON-encoded StageKey
    sent_at TEXT NOT NULL,   -- RFC 3339 UTC
    PRIMARY KEY (subject, stage)
);

CREATE INDEX IF NOT EXISTS idx_notifications_sent_at ON notifications_sent(sent_at);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. Seeds the schema version on a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read the current schema version from the database.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let value: String = row.get(0)?;
            Ok(value.parse().ok())
        }
        None => Ok(None),
    }
}
