//! End-to-end scheduler scenarios against in-memory stores and a recording
//! transport.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use ticktock::push::RecordingTransport;
use ticktock::scheduler::tasks::RolloverFields;
use ticktock::scheduler::{PushSubscription, Recurrence, SubscriptionKeys, Task};
use ticktock::store::{SubscriptionStore, TaskStore};
use ticktock::time_math::{RemindAt, WeekdaySet};
use ticktock::{
    DeliveryError, MemoryLedger, MemoryStore, NotifierConfig, NotifyError, Scheduler,
    StoreHandles,
};

struct Env {
    store: Arc<MemoryStore>,
    ledger: Arc<MemoryLedger>,
    transport: Arc<RecordingTransport>,
}

impl Env {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            ledger: Arc::new(MemoryLedger::new()),
            transport: Arc::new(RecordingTransport::new()),
        }
    }

    fn handles(&self) -> StoreHandles {
        StoreHandles::in_memory(self.store.clone(), self.ledger.clone())
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.handles(), &NotifierConfig::default())
            .unwrap()
            .with_transport(self.transport.clone())
    }

    fn subscribe(&self, owner: &str, endpoint: &str, tz_offset_minutes: Option<i32>) {
        let mut sub = PushSubscription::new(owner, endpoint, keys());
        sub.tz_offset_minutes = tz_offset_minutes;
        self.store.upsert_subscription(sub).unwrap();
    }

    fn task(&self, owner: &str, id: &str, due: NaiveDate, hour: u8, minute: u8) -> Task {
        let task = Task::new(
            owner,
            id,
            format!("Task {id}"),
            Recurrence::every(1),
            due,
            RemindAt::new(hour, minute).unwrap(),
        );
        self.store.upsert_task(task.clone()).unwrap();
        task
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.transport.delivered_kinds()
    }

    fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

fn keys() -> SubscriptionKeys {
    SubscriptionKeys {
        p256dh: "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7DkM".to_owned(),
        auth: "tBHItJI5svbpez7KI4CCXg".to_owned(),
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

#[tokio::test]
async fn hour_warning_then_due_reminder_in_owner_timezone() {
    let env = Env::new();
    // UTC-5: 09:00 local is 14:00Z.
    env.subscribe("alice", "https://push.example/a", Some(-300));
    env.task("alice", "t1", date(2025, 6, 1), 9, 0);
    let mut scheduler = env.scheduler();

    // 08:00:30 local.
    scheduler.tick_at(utc(2025, 6, 1, 13, 0, 30)).await;
    assert_eq!(env.count("task-hour"), 1);
    assert_eq!(env.count("task-due"), 0);

    // 09:00:15 local.
    scheduler.tick_at(utc(2025, 6, 1, 14, 0, 15)).await;
    assert_eq!(env.count("task-hour"), 1);
    assert_eq!(env.count("task-due"), 1);

    let due = env
        .transport
        .delivered()
        .into_iter()
        .find(|p| p.payload.kind() == "task-due")
        .unwrap();
    assert_eq!(due.payload.task_id(), Some("t1"));
    assert_eq!(due.payload.content().title, "Task t1");
}

#[tokio::test]
async fn each_stage_is_sent_at_most_once() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    env.task("alice", "t1", date(2025, 6, 1), 9, 0);

    let now = utc(2025, 6, 1, 9, 0, 10);
    let mut scheduler = env.scheduler();
    scheduler.tick_at(now).await;
    let report = scheduler.tick_at(now).await;
    assert_eq!(report.duplicates_suppressed, 1);
    assert_eq!(report.notifications_sent, 0);

    // A restarted scheduler sharing the same ledger does not resend.
    let mut restarted = env.scheduler();
    restarted.tick_at(now).await;

    assert_eq!(env.count("task-due"), 1);
    assert_eq!(env.ledger.len(), 1);
}

#[tokio::test]
async fn subscription_offset_wins_over_profile_offset() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", Some(330));
    env.store.set_profile_offset("alice", -300).unwrap();
    env.subscribe("bob", "https://push.example/b", None);
    env.store.set_profile_offset("bob", -300).unwrap();
    env.subscribe("carol", "https://push.example/c", None);
    for owner in ["alice", "bob", "carol"] {
        env.task(owner, "t1", date(2025, 3, 10), 9, 0);
    }
    let mut scheduler = env.scheduler();

    // 09:00 at UTC+05:30.
    scheduler.tick_at(utc(2025, 3, 10, 3, 30, 0)).await;
    // 09:00 at UTC.
    scheduler.tick_at(utc(2025, 3, 10, 9, 0, 0)).await;
    // 09:00 at UTC-5.
    scheduler.tick_at(utc(2025, 3, 10, 14, 0, 0)).await;

    let due_owners: Vec<String> = env
        .transport
        .delivered()
        .into_iter()
        .filter(|p| p.payload.kind() == "task-due")
        .map(|p| p.owner)
        .collect();
    assert_eq!(due_owners, vec!["alice", "carol", "bob"]);
}

#[tokio::test]
async fn completed_weekday_task_advances_to_next_scheduled_day() {
    let env = Env::new();
    let mut task = Task::new(
        "alice",
        "gym",
        "Gym",
        Recurrence::weekly(WeekdaySet::from_days([1, 3, 5]).unwrap()),
        date(2025, 3, 12),
        RemindAt::new(18, 0).unwrap(),
    );
    // Completed on Wednesday 2025-03-12.
    task.last_completed = Some(utc(2025, 3, 12, 18, 30, 0));
    env.store.upsert_task(task).unwrap();
    let mut scheduler = env.scheduler();

    let report = scheduler.tick_at(utc(2025, 3, 13, 7, 0, 0)).await;
    assert_eq!(report.rollovers, 1);
    let task = env.store.get_task("alice", "gym").unwrap().unwrap();
    assert_eq!(task.next_due, date(2025, 3, 14));
    assert!(!task.priority);

    // Running the rollover again for the same completion is a no-op.
    let report = scheduler.tick_at(utc(2025, 3, 13, 7, 1, 0)).await;
    assert_eq!(report.rollovers, 0);
    let report = scheduler.tick_at(utc(2025, 3, 13, 12, 0, 0)).await;
    assert_eq!(report.rollovers, 0);
    assert_eq!(
        env.store.get_task("alice", "gym").unwrap().unwrap().next_due,
        date(2025, 3, 14)
    );
}

#[tokio::test]
async fn missed_task_is_carried_forward_once_per_day() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    env.task("alice", "t1", date(2025, 6, 1), 9, 0);
    let mut scheduler = env.scheduler();

    let report = scheduler.tick_at(utc(2025, 6, 2, 0, 5, 0)).await;
    assert_eq!(report.carried_forward, 1);
    let task = env.store.get_task("alice", "t1").unwrap().unwrap();
    assert_eq!(task.next_due, date(2025, 6, 2));
    assert!(task.priority);
    assert_eq!(env.count("task-missed"), 1);

    // Same day again: nothing new.
    scheduler.tick_at(utc(2025, 6, 2, 0, 30, 0)).await;
    assert_eq!(env.count("task-missed"), 1);

    // Still unresolved the next day: a second notice, dated the new day.
    let report = scheduler.tick_at(utc(2025, 6, 3, 0, 5, 0)).await;
    assert_eq!(report.carried_forward, 1);
    assert_eq!(env.count("task-missed"), 2);
    assert_eq!(
        env.store.get_task("alice", "t1").unwrap().unwrap().next_due,
        date(2025, 6, 3)
    );

    let missed = env
        .transport
        .delivered()
        .into_iter()
        .find(|p| p.payload.kind() == "task-missed")
        .unwrap();
    assert_eq!(missed.payload.content().title, "Missed: Task t1");
    assert_eq!(
        missed.payload.content().body,
        "Missed. New deadline: today at 09:00"
    );
}

#[tokio::test]
async fn permanently_failing_subscriptions_are_removed() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/gone", None);
    env.subscribe("alice", "https://push.example/rekeyed", None);
    env.subscribe("alice", "https://push.example/ok", None);
    env.transport.fail_always(
        "https://push.example/gone",
        DeliveryError::permanent("HTTP 410"),
    );
    env.transport.fail_always(
        "https://push.example/rekeyed",
        DeliveryError::key_mismatch("HTTP 403"),
    );
    env.task("alice", "t1", date(2025, 6, 1), 9, 0);
    let mut scheduler = env.scheduler();

    let report = scheduler.tick_at(utc(2025, 6, 1, 9, 0, 10)).await;
    assert_eq!(report.subscriptions_pruned, 2);
    assert_eq!(report.notifications_sent, 1);

    let remaining: Vec<String> = SubscriptionStore::list_by_owner(env.store.as_ref(), "alice")
        .unwrap()
        .into_iter()
        .map(|s| s.endpoint)
        .collect();
    assert_eq!(remaining, vec!["https://push.example/ok"]);
    assert_eq!(env.ledger.len(), 1);
}

#[tokio::test]
async fn completed_today_suppresses_reminders_and_summary_count() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    let mut done = env.task("alice", "done", date(2025, 6, 1), 9, 0);
    done.last_completed = Some(utc(2025, 6, 1, 7, 0, 0));
    env.store.upsert_task(done).unwrap();
    env.task("alice", "pending", date(2025, 6, 1), 18, 0);
    env.task("alice", "tomorrow", date(2025, 6, 2), 9, 0);
    let mut scheduler = env.scheduler();

    scheduler.tick_at(utc(2025, 6, 1, 8, 0, 20)).await;
    scheduler.tick_at(utc(2025, 6, 1, 9, 0, 20)).await;

    assert_eq!(env.count("task-hour"), 0);
    assert_eq!(env.count("task-due"), 0);
    let summaries: Vec<String> = env
        .transport
        .delivered()
        .into_iter()
        .filter(|p| p.payload.kind() == "daily-summary")
        .map(|p| p.payload.content().body.clone())
        .collect();
    assert_eq!(summaries, vec!["You have 1 task due today"]);
}

#[tokio::test]
async fn summary_is_skipped_when_nothing_is_due() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    env.task("alice", "later", date(2025, 6, 5), 9, 0);
    let mut scheduler = env.scheduler();

    scheduler.tick_at(utc(2025, 6, 1, 8, 0, 20)).await;
    assert!(env.kinds().is_empty());
}

#[tokio::test]
async fn without_transport_rollovers_still_run() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    env.task("alice", "missed", date(2025, 6, 1), 9, 0);
    let mut completed = env.task("alice", "completed", date(2025, 6, 1), 9, 0);
    completed.last_completed = Some(utc(2025, 6, 1, 8, 0, 0));
    env.store.upsert_task(completed).unwrap();

    let mut scheduler = Scheduler::new(env.handles(), &NotifierConfig::default()).unwrap();
    let report = scheduler.tick_at(utc(2025, 6, 2, 9, 0, 10)).await;

    assert_eq!(report.rollovers, 1);
    assert_eq!(report.carried_forward, 1);
    assert_eq!(report.notifications_sent, 0);
    assert!(env.ledger.is_empty());
    assert!(env.transport.attempts().is_empty());
    assert_eq!(
        env.store.get_task("alice", "completed").unwrap().unwrap().next_due,
        date(2025, 6, 2)
    );
}

/// Task store whose rollover write fails for one task id.
struct FlakyTasks {
    inner: Arc<MemoryStore>,
    broken_id: &'static str,
}

impl TaskStore for FlakyTasks {
    fn scan_all(&self) -> ticktock::Result<Vec<ticktock::Result<Task>>> {
        self.inner.scan_all()
    }

    fn list_by_owner(&self, owner: &str) -> ticktock::Result<Vec<Task>> {
        TaskStore::list_by_owner(self.inner.as_ref(), owner)
    }

    fn update_rollover_fields(
        &self,
        owner: &str,
        id: &str,
        fields: RolloverFields,
    ) -> ticktock::Result<bool> {
        if id == self.broken_id {
            return Err(NotifyError::StoreUnavailable("disk full".to_owned()));
        }
        self.inner.update_rollover_fields(owner, id, fields)
    }
}

#[tokio::test]
async fn one_failing_task_does_not_stop_the_tick() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    let mut broken = env.task("alice", "broken", date(2025, 5, 31), 9, 0);
    broken.last_completed = Some(utc(2025, 5, 31, 12, 0, 0));
    env.store.upsert_task(broken).unwrap();
    env.task("alice", "healthy", date(2025, 6, 1), 9, 0);

    let flaky: Arc<dyn TaskStore> = Arc::new(FlakyTasks {
        inner: env.store.clone(),
        broken_id: "broken",
    });
    let mut handles = env.handles();
    handles.tasks = flaky;
    let mut scheduler = Scheduler::new(handles, &NotifierConfig::default())
        .unwrap()
        .with_transport(env.transport.clone());

    let report = scheduler.tick_at(utc(2025, 6, 1, 9, 0, 10)).await;
    assert_eq!(report.task_errors, 1);
    let due: Vec<_> = env
        .transport
        .delivered()
        .into_iter()
        .filter(|p| p.payload.kind() == "task-due")
        .map(|p| p.payload.task_id().map(str::to_owned))
        .collect();
    assert_eq!(due, vec![Some("healthy".to_owned())]);
}

#[tokio::test]
async fn interval_past_calendar_end_fails_only_that_task() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    let mut endless = env.task("alice", "endless", date(2025, 5, 31), 9, 0);
    endless.recurrence = Recurrence::every(200_000_000);
    endless.last_completed = Some(utc(2025, 5, 31, 12, 0, 0));
    env.store.upsert_task(endless).unwrap();
    env.task("alice", "healthy", date(2025, 6, 1), 9, 0);

    let mut scheduler = env.scheduler();
    let report = scheduler.tick_at(utc(2025, 6, 1, 9, 0, 10)).await;

    assert!(!report.scan_failed);
    assert_eq!(report.task_errors, 1);
    assert_eq!(report.rollovers, 0);
    assert_eq!(env.count("task-due"), 1);
    assert_eq!(
        env.store.get_task("alice", "endless").unwrap().unwrap().next_due,
        date(2025, 5, 31)
    );

    // The background loop keeps ticking past the bad record.
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = env.scheduler().run(cancel.clone());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    cancel.cancel();
    handle.await.unwrap();
}

/// Task store whose scan holds the calling thread, like a slow disk.
struct SluggishTasks {
    inner: Arc<MemoryStore>,
    scan_finished: std::sync::Mutex<Option<std::time::Instant>>,
}

impl TaskStore for SluggishTasks {
    fn scan_all(&self) -> ticktock::Result<Vec<ticktock::Result<Task>>> {
        std::thread::sleep(std::time::Duration::from_millis(300));
        *self.scan_finished.lock().unwrap() = Some(std::time::Instant::now());
        self.inner.scan_all()
    }

    fn list_by_owner(&self, owner: &str) -> ticktock::Result<Vec<Task>> {
        TaskStore::list_by_owner(self.inner.as_ref(), owner)
    }

    fn update_rollover_fields(
        &self,
        owner: &str,
        id: &str,
        fields: RolloverFields,
    ) -> ticktock::Result<bool> {
        self.inner.update_rollover_fields(owner, id, fields)
    }
}

#[tokio::test]
async fn slow_task_scan_does_not_block_the_runtime() {
    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    env.task("alice", "t1", date(2025, 6, 1), 9, 0);

    let sluggish = Arc::new(SluggishTasks {
        inner: env.store.clone(),
        scan_finished: std::sync::Mutex::new(None),
    });
    let mut handles = env.handles();
    handles.tasks = sluggish.clone();
    let mut scheduler = Scheduler::new(handles, &NotifierConfig::default())
        .unwrap()
        .with_transport(env.transport.clone());

    // Single-threaded runtime: the timer only fires if the scan runs
    // somewhere other than this thread.
    let (report, woke_at) = tokio::join!(scheduler.tick_at(utc(2025, 6, 1, 9, 0, 10)), async {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::time::Instant::now()
    });

    assert_eq!(report.notifications_sent, 1);
    let scan_finished = sluggish.scan_finished.lock().unwrap().unwrap();
    assert!(woke_at < scan_finished);
}

#[tokio::test]
async fn slow_push_service_counts_as_transient() {
    use async_trait::async_trait;
    use ticktock::push::{NotificationPayload, PushTransport};

    struct Stalled;

    #[async_trait]
    impl PushTransport for Stalled {
        fn id(&self) -> &'static str {
            "stalled"
        }

        async fn send(
            &self,
            _subscription: &PushSubscription,
            _payload: &NotificationPayload,
        ) -> Result<(), DeliveryError> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    let env = Env::new();
    env.subscribe("alice", "https://push.example/a", None);
    env.task("alice", "t1", date(2025, 6, 1), 9, 0);
    let mut config = NotifierConfig::default();
    config.push.timeout_secs = 1;
    let mut scheduler = Scheduler::new(env.handles(), &config)
        .unwrap()
        .with_transport(Arc::new(Stalled));

    let report = scheduler.tick_at(utc(2025, 6, 1, 9, 0, 10)).await;
    assert_eq!(report.transient_failures, 1);
    assert!(env.ledger.is_empty());
    assert_eq!(scheduler.pending_retries().len(), 1);
}
