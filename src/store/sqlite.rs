//! SQLite-backed store.
//!
//! One database file holds tasks, push subscriptions, owner profiles and the
//! idempotency ledger. Thread-safe via an internal `Mutex<Connection>`; all
//! statements are serialized.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::schema::{apply_schema, read_schema_version};
use crate::error::{NotifyError, Result};
use crate::scheduler::ledger::{IdempotencyLedger, LedgerKey};
use crate::scheduler::tasks::{
    PushSubscription, Recurrence, RolloverFields, SubscriptionKeys, Task,
};
use crate::store::{ProfileStore, SubscriptionStore, TaskStore};
use crate::time_math::{RemindAt, TzOffset, WeekdaySet};

const DATE_FORMAT: &str = "%Y-%m-%d";

const TASK_COLUMNS: &str = "owner, id, title, notes, every_days, schedule_days, next_due, \
                            remind_at, priority, last_completed";

/// SQLite implementation of every store contract.
pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        apply_schema(&conn)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    /// Database file location (`None` for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NotifyError::StoreUnavailable(format!("sqlite lock poisoned: {e}")))
    }

    /// Insert or replace a task.
    pub fn upsert_task(&self, task: &Task) -> Result<()> {
        let schedule_days = serde_json::to_string(&task.recurrence.schedule_days)
            .map_err(|e| NotifyError::InvalidTask(format!("cannot encode schedule days: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO tasks ({TASK_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                task.owner,
                task.id,
                task.title,
                task.notes,
                task.recurrence.every_days,
                schedule_days,
                task.next_due.format(DATE_FORMAT).to_string(),
                task.remind_at.to_string(),
                task.priority,
                task.last_completed.map(format_instant),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, owner: &str, id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner = ?1 AND id = ?2"),
                params![owner, id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Record a completion, as the completion handler would.
    pub fn mark_completed(&self, owner: &str, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET last_completed = ?1 WHERE owner = ?2 AND id = ?3",
            params![format_instant(at), owner, id],
        )?;
        Ok(changed > 0)
    }

    /// Insert or replace a subscription (matched on owner + endpoint).
    pub fn upsert_subscription(&self, sub: &PushSubscription) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO push_subscriptions \
             (owner, endpoint, p256dh, auth, tz_offset_minutes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sub.owner,
                sub.endpoint,
                sub.keys.p256dh,
                sub.keys.auth,
                sub.tz_offset_minutes,
                format_instant(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Store a profile-level timezone offset for an owner.
    pub fn set_profile_offset(&self, owner: &str, minutes: i32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO owner_profiles (owner, tz_offset_minutes) VALUES (?1, ?2) \
             ON CONFLICT(owner) DO UPDATE SET tz_offset_minutes = excluded.tz_offset_minutes",
            params![owner, minutes],
        )?;
        Ok(())
    }

    /// Rows decode independently; only a failed step aborts the query.
    fn query_tasks(&self, sql: &str, owner: Option<&str>) -> Result<Vec<Result<Task>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = match owner {
            Some(owner) => stmt.query(params![owner])?,
            None => stmt.query([])?,
        };
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(decode_task_row(row));
        }
        Ok(tasks)
    }
}

impl TaskStore for SqliteStore {
    fn scan_all(&self) -> Result<Vec<Result<Task>>> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY owner, id"),
            None,
        )
    }

    fn list_by_owner(&self, owner: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner = ?1 ORDER BY id"),
            Some(owner),
        )?
        .into_iter()
        .collect()
    }

    fn update_rollover_fields(
        &self,
        owner: &str,
        id: &str,
        fields: RolloverFields,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET next_due = ?1, priority = ?2 WHERE owner = ?3 AND id = ?4",
            params![
                fields.next_due.format(DATE_FORMAT).to_string(),
                fields.priority,
                owner,
                id
            ],
        )?;
        Ok(changed > 0)
    }
}

impl SubscriptionStore for SqliteStore {
    fn list_by_owner(&self, owner: &str) -> Result<Vec<PushSubscription>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT owner, endpoint, p256dh, auth, tz_offset_minutes \
             FROM push_subscriptions WHERE owner = ?1 ORDER BY created_at, endpoint",
        )?;
        let rows = stmt.query_map(params![owner], |row| {
            Ok(PushSubscription {
                owner: row.get(0)?,
                endpoint: row.get(1)?,
                keys: SubscriptionKeys {
                    p256dh: row.get(2)?,
                    auth: row.get(3)?,
                },
                tz_offset_minutes: row.get(4)?,
            })
        })?;
        let mut subs = Vec::new();
        for sub in rows {
            subs.push(sub?);
        }
        Ok(subs)
    }

    fn remove(&self, owner: &str, endpoint: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM push_subscriptions WHERE owner = ?1 AND endpoint = ?2",
            params![owner, endpoint],
        )?;
        Ok(changed > 0)
    }
}

impl ProfileStore for SqliteStore {
    fn timezone_offset(&self, owner: &str) -> Result<Option<TzOffset>> {
        let conn = self.lock()?;
        let minutes: Option<Option<i32>> = conn
            .query_row(
                "SELECT tz_offset_minutes FROM owner_profiles WHERE owner = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;
        Ok(minutes.flatten().and_then(TzOffset::from_minutes))
    }
}

impl IdempotencyLedger for SqliteStore {
    fn was_sent(&self, key: &LedgerKey) -> Result<bool> {
        let subject = key.subject_column()?;
        let stage = key.stage_column()?;
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM notifications_sent WHERE subject = ?1 AND stage = ?2",
                params![subject, stage],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn mark_sent(&self, key: &LedgerKey, sent_at: DateTime<Utc>) -> Result<bool> {
        let subject = key.subject_column()?;
        let stage = key.stage_column()?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO notifications_sent (subject, stage, sent_at) \
             VALUES (?1, ?2, ?3)",
            params![subject, stage, format_instant(sent_at)],
        )?;
        Ok(inserted > 0)
    }

    fn prune_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM notifications_sent WHERE sent_at < ?1",
            params![format_instant(cutoff)],
        )?;
        Ok(removed)
    }
}

fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// Tag a decode failure with the row's key so the operator can find it.
fn decode_task_row(row: &Row<'_>) -> Result<Task> {
    row_to_task(row).map_err(|e| {
        let owner: String = row.get(0).unwrap_or_default();
        let id: String = row.get(1).unwrap_or_default();
        NotifyError::InvalidTask(format!("{owner}/{id}: {e}"))
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let schedule_days: String = row.get(5)?;
    let schedule_days: WeekdaySet = serde_json::from_str(&schedule_days)
        .map_err(|e| conversion_error(5, format!("schedule_days: {e}")))?;

    let next_due: String = row.get(6)?;
    let next_due = NaiveDate::parse_from_str(&next_due, DATE_FORMAT)
        .map_err(|e| conversion_error(6, format!("next_due {next_due:?}: {e}")))?;

    let remind_at: String = row.get(7)?;
    let remind_at: RemindAt = remind_at
        .parse()
        .map_err(|e: String| conversion_error(7, e))?;

    let last_completed: Option<String> = row.get(9)?;
    let last_completed = last_completed
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| conversion_error(9, format!("last_completed {raw:?}: {e}")))
        })
        .transpose()?;

    Ok(Task {
        owner: row.get(0)?,
        id: row.get(1)?,
        title: row.get(2)?,
        notes: row.get(3)?,
        recurrence: Recurrence {
            every_days: row.get(4)?,
            schedule_days,
        },
        next_due,
        remind_at,
        priority: row.get(8)?,
        last_completed,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::scheduler::ledger::{StageKey, Subject};

    fn sample_task() -> Task {
        let mut task = Task::new(
            "alice",
            "t1",
            "Stretch",
            Recurrence::weekly(WeekdaySet::from_days([1, 3, 5]).unwrap()),
            NaiveDate::from_ymd_opt(2025, 3, 12).unwrap(),
            RemindAt::new(7, 30).unwrap(),
        );
        task.notes = "10 minutes".to_owned();
        task
    }

    #[test]
    fn task_round_trips_through_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut task = sample_task();
        task.last_completed = Some(
            DateTime::parse_from_rfc3339("2025-03-12T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        store.upsert_task(&task).unwrap();

        let loaded = store.get_task("alice", "t1").unwrap().unwrap();
        assert_eq!(loaded, task);
        assert_eq!(store.scan_all().unwrap().len(), 1);
        assert!(TaskStore::list_by_owner(&store, "bob").unwrap().is_empty());
    }

    #[test]
    fn corrupt_row_is_reported_alone() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_task(&sample_task()).unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO tasks (owner, id, title, next_due, remind_at) \
                 VALUES ('alice', 't0', 'Broken', '2025-6-1x', '09:00')",
                [],
            )
            .unwrap();

        let rows = store.scan_all().unwrap();
        assert_eq!(rows.len(), 2);
        match &rows[0] {
            Err(NotifyError::InvalidTask(msg)) => assert!(msg.starts_with("alice/t0:")),
            other => panic!("expected a decode error, got {other:?}"),
        }
        assert_eq!(rows[1].as_ref().unwrap(), &sample_task());

        assert!(TaskStore::list_by_owner(&store, "alice").is_err());
        assert!(store.get_task("alice", "t1").unwrap().is_some());
    }

    #[test]
    fn profile_offset_out_of_range_is_ignored() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.timezone_offset("alice").unwrap().is_none());
        store.set_profile_offset("alice", -300).unwrap();
        assert_eq!(store.timezone_offset("alice").unwrap().unwrap().minutes(), -300);
        store.set_profile_offset("alice", 9999).unwrap();
        assert!(store.timezone_offset("alice").unwrap().is_none());
    }

    #[test]
    fn ledger_insert_if_absent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = LedgerKey::new(
            Subject::task("alice", "t1"),
            StageKey::Due {
                occurrence: sample_task().occurrence(),
            },
        );
        let now = Utc::now();
        assert!(!store.was_sent(&key).unwrap());
        assert!(store.mark_sent(&key, now).unwrap());
        assert!(!store.mark_sent(&key, now).unwrap());
        assert!(store.was_sent(&key).unwrap());
    }
}
