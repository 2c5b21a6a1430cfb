//! In-process stores.
//!
//! Backed by `Mutex<HashMap<..>>`. Useful for embedding the engine in a
//! single process and for tests; nothing survives a restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{NotifyError, Result};
use crate::scheduler::ledger::{IdempotencyLedger, LedgerKey};
use crate::scheduler::tasks::{PushSubscription, RolloverFields, Task};
use crate::store::{ProfileStore, SubscriptionStore, TaskStore};
use crate::time_math::TzOffset;

type TaskKey = (String, String);

/// Task, subscription and profile store held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<TaskKey, Task>>,
    subscriptions: Mutex<HashMap<String, Vec<PushSubscription>>>,
    profiles: Mutex<HashMap<String, i32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| NotifyError::StoreUnavailable(format!("memory store lock poisoned: {e}")))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task.
    pub fn upsert_task(&self, task: Task) -> Result<()> {
        lock(&self.tasks)?.insert((task.owner.clone(), task.id.clone()), task);
        Ok(())
    }

    pub fn get_task(&self, owner: &str, id: &str) -> Result<Option<Task>> {
        Ok(lock(&self.tasks)?
            .get(&(owner.to_owned(), id.to_owned()))
            .cloned())
    }

    /// Record a completion, as the completion handler would.
    pub fn mark_completed(&self, owner: &str, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut tasks = lock(&self.tasks)?;
        match tasks.get_mut(&(owner.to_owned(), id.to_owned())) {
            Some(task) => {
                task.last_completed = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Insert or replace a subscription (matched on owner + endpoint).
    pub fn upsert_subscription(&self, subscription: PushSubscription) -> Result<()> {
        let mut subs = lock(&self.subscriptions)?;
        let list = subs.entry(subscription.owner.clone()).or_default();
        if let Some(existing) = list
            .iter_mut()
            .find(|s| s.endpoint == subscription.endpoint)
        {
            *existing = subscription;
        } else {
            list.push(subscription);
        }
        Ok(())
    }

    /// Store a profile-level timezone offset for an owner.
    pub fn set_profile_offset(&self, owner: &str, minutes: i32) -> Result<()> {
        lock(&self.profiles)?.insert(owner.to_owned(), minutes);
        Ok(())
    }

    fn sorted_tasks(&self, keep: impl Fn(&Task) -> bool) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = lock(&self.tasks)?
            .values()
            .filter(|t| keep(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| (&a.owner, &a.id).cmp(&(&b.owner, &b.id)));
        Ok(tasks)
    }
}

impl TaskStore for MemoryStore {
    fn scan_all(&self) -> Result<Vec<Result<Task>>> {
        Ok(self.sorted_tasks(|_| true)?.into_iter().map(Ok).collect())
    }

    fn list_by_owner(&self, owner: &str) -> Result<Vec<Task>> {
        self.sorted_tasks(|t| t.owner == owner)
    }

    fn update_rollover_fields(
        &self,
        owner: &str,
        id: &str,
        fields: RolloverFields,
    ) -> Result<bool> {
        let mut tasks = lock(&self.tasks)?;
        match tasks.get_mut(&(owner.to_owned(), id.to_owned())) {
            Some(task) => {
                task.next_due = fields.next_due;
                task.priority = fields.priority;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl SubscriptionStore for MemoryStore {
    fn list_by_owner(&self, owner: &str) -> Result<Vec<PushSubscription>> {
        Ok(lock(&self.subscriptions)?
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }

    fn remove(&self, owner: &str, endpoint: &str) -> Result<bool> {
        let mut subs = lock(&self.subscriptions)?;
        let Some(list) = subs.get_mut(owner) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|s| s.endpoint != endpoint);
        Ok(list.len() != before)
    }
}

impl ProfileStore for MemoryStore {
    fn timezone_offset(&self, owner: &str) -> Result<Option<TzOffset>> {
        Ok(lock(&self.profiles)?
            .get(owner)
            .copied()
            .and_then(TzOffset::from_minutes))
    }
}

/// Ledger held in memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<LedgerKey, DateTime<Utc>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All recorded keys.
    pub fn keys(&self) -> Result<Vec<LedgerKey>> {
        Ok(lock(&self.entries)?.keys().cloned().collect())
    }
}

impl IdempotencyLedger for MemoryLedger {
    fn was_sent(&self, key: &LedgerKey) -> Result<bool> {
        Ok(lock(&self.entries)?.contains_key(key))
    }

    fn mark_sent(&self, key: &LedgerKey, sent_at: DateTime<Utc>) -> Result<bool> {
        let mut entries = lock(&self.entries)?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.clone(), sent_at);
        Ok(true)
    }

    fn prune_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = lock(&self.entries)?;
        let before = entries.len();
        entries.retain(|_, sent_at| *sent_at >= cutoff);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::scheduler::ledger::{StageKey, Subject};
    use crate::scheduler::tasks::{Recurrence, SubscriptionKeys};
    use crate::time_math::RemindAt;
    use chrono::{Duration, NaiveDate};

    fn keys() -> SubscriptionKeys {
        SubscriptionKeys {
            p256dh: "p".to_owned(),
            auth: "a".to_owned(),
        }
    }

    #[test]
    fn rollover_update_touches_only_rollover_fields() {
        let store = MemoryStore::new();
        let due = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let mut task = Task::new(
            "alice",
            "t1",
            "Title",
            Recurrence::every(1),
            due,
            RemindAt::new(9, 0).unwrap(),
        );
        task.notes = "keep me".to_owned();
        store.upsert_task(task).unwrap();

        let fields = RolloverFields {
            next_due: due + Duration::days(1),
            priority: true,
        };
        assert!(store.update_rollover_fields("alice", "t1", fields).unwrap());
        assert!(!store.update_rollover_fields("alice", "nope", fields).unwrap());

        let task = store.get_task("alice", "t1").unwrap().unwrap();
        assert_eq!(task.next_due, due + Duration::days(1));
        assert!(task.priority);
        assert_eq!(task.notes, "keep me");
    }

    #[test]
    fn subscription_upsert_and_remove() {
        let store = MemoryStore::new();
        store
            .upsert_subscription(PushSubscription::new("alice", "https://p/1", keys()))
            .unwrap();
        store
            .upsert_subscription(
                PushSubscription::new("alice", "https://p/1", keys()).with_tz_offset(60),
            )
            .unwrap();
        let subs = SubscriptionStore::list_by_owner(&store, "alice").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].tz_offset_minutes, Some(60));

        assert!(store.remove("alice", "https://p/1").unwrap());
        assert!(!store.remove("alice", "https://p/1").unwrap());
        assert!(SubscriptionStore::list_by_owner(&store, "bob").unwrap().is_empty());
    }

    #[test]
    fn ledger_mark_is_idempotent_and_prunable() {
        let ledger = MemoryLedger::new();
        let key = LedgerKey::new(
            Subject::summary("alice"),
            StageKey::Summary {
                date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            },
        );
        let now = Utc::now();
        assert!(!ledger.was_sent(&key).unwrap());
        assert!(ledger.mark_sent(&key, now).unwrap());
        assert!(!ledger.mark_sent(&key, now).unwrap());
        assert!(ledger.was_sent(&key).unwrap());
        assert_eq!(ledger.len(), 1);

        assert_eq!(ledger.prune_sent_before(now - Duration::days(1)).unwrap(), 0);
        assert_eq!(ledger.prune_sent_before(now + Duration::seconds(1)).unwrap(), 1);
        assert!(ledger.is_empty());
    }
}
