//! Scheduler background loop.
//!
//! Every tick scans all tasks, applies rollovers, and sends whichever
//! reminder stages fall inside the lookback window. The idempotency ledger
//! is consulted before, and written after, each delivery so a stage reaches
//! an owner at most once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;
use crate::error::{NotifyError, Result};
use crate::push::{DeliveryError, NotificationPayload, PayloadStyle, PushTransport};
use crate::scheduler::authority::{LeaderLease, LeadershipDecision};
use crate::scheduler::ledger::{IdempotencyLedger, LedgerKey, StageKey, Subject};
use crate::scheduler::stages::{self, OwnerClock, TickWindow};
use crate::scheduler::tasks::{PushSubscription, RolloverFields, Task};
use crate::store::{ProfileStore, StoreHandles, SubscriptionStore, TaskStore};
use crate::time_math::{RemindAt, TzOffset};

/// How often the ledger is pruned.
const LEDGER_PRUNE_EVERY_HOURS: i64 = 24;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub tasks_scanned: usize,
    pub rollovers: usize,
    pub carried_forward: usize,
    /// Individual endpoint deliveries that were accepted.
    pub notifications_sent: usize,
    pub duplicates_suppressed: usize,
    pub transient_failures: usize,
    pub subscriptions_pruned: usize,
    pub task_errors: usize,
    /// The task scan itself failed; nothing else ran.
    pub scan_failed: bool,
}

impl TickReport {
    /// `true` when the tick changed nothing and sent nothing.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.rollovers == 0
            && self.carried_forward == 0
            && self.notifications_sent == 0
            && self.transient_failures == 0
            && self.subscriptions_pruned == 0
            && self.task_errors == 0
            && !self.scan_failed
    }
}

/// Result of sending one payload to all of an owner's subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub delivered: usize,
    pub transient: usize,
    pub permanent: usize,
    /// Endpoints removed because the push service rejected them for good.
    pub pruned: Vec<String>,
}

impl DeliverySummary {
    /// The stage counts as sent unless every failure was retryable and
    /// nothing got through.
    #[must_use]
    pub fn should_mark_sent(&self) -> bool {
        self.delivered > 0 || self.transient == 0
    }
}

struct OwnerState {
    clock: OwnerClock,
    subscriptions: Vec<PushSubscription>,
    due_today: usize,
}

/// Shared state for the tasks evaluated concurrently within one tick.
struct TickContext {
    now: DateTime<Utc>,
    window: TickWindow,
    owners: Mutex<HashMap<String, OwnerState>>,
    report: Mutex<TickReport>,
    next_retries: Mutex<HashMap<LedgerKey, u32>>,
}

impl TickContext {
    fn new(now: DateTime<Utc>, window: TickWindow) -> Self {
        Self {
            now,
            window,
            owners: Mutex::new(HashMap::new()),
            report: Mutex::new(TickReport {
                started_at: now,
                window_start: window.start,
                ..TickReport::default()
            }),
            next_retries: Mutex::new(HashMap::new()),
        }
    }

    fn tally(&self, update: impl FnOnce(&mut TickReport)) {
        update(&mut lock(&self.report));
    }

    fn subscriptions_for(&self, owner: &str) -> Vec<PushSubscription> {
        lock(&self.owners)
            .get(owner)
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }

    fn count_due_today(&self, owner: &str) {
        if let Some(state) = lock(&self.owners).get_mut(owner) {
            state.due_today += 1;
        }
    }

    fn record_delivery(&self, owner: &str, summary: &DeliverySummary) {
        if !summary.pruned.is_empty()
            && let Some(state) = lock(&self.owners).get_mut(owner)
        {
            state
                .subscriptions
                .retain(|s| !summary.pruned.contains(&s.endpoint));
        }
        self.tally(|r| {
            r.notifications_sent += summary.delivered;
            r.transient_failures += summary.transient;
            r.subscriptions_pruned += summary.pruned.len();
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a synchronous store call on the blocking pool so database I/O never
/// stalls the async workers driving deliveries.
async fn blocking<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| NotifyError::StoreUnavailable(format!("store call did not finish: {e}")))?
}

/// Reminder scheduler.
pub struct Scheduler {
    tasks: Arc<dyn TaskStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    profiles: Arc<dyn ProfileStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    /// `None` when push credentials are missing; delivery stages are skipped.
    transport: Option<Arc<dyn PushTransport>>,
    tick_interval: Duration,
    push_timeout: std::time::Duration,
    summary_time: RemindAt,
    max_concurrency: usize,
    max_delivery_attempts: u32,
    ledger_retention: Duration,
    style: PayloadStyle,
    leader_lease: Option<LeaderLease>,
    report_tx: Option<mpsc::UnboundedSender<TickReport>>,
    /// Stages whose last delivery failed transiently, with attempt counts.
    retries: HashMap<LedgerKey, u32>,
    last_tick_at: Option<DateTime<Utc>>,
    last_prune_at: Option<DateTime<Utc>>,
}

impl Scheduler {
    /// Create a scheduler over `stores`. Delivery stays disabled until a
    /// transport is attached with [`Scheduler::with_transport`].
    pub fn new(stores: StoreHandles, config: &NotifierConfig) -> Result<Self> {
        config.validate()?;
        let sched = &config.scheduler;

        let tick_interval = Duration::from_std(sched.tick_interval())
            .map_err(|e| NotifyError::Config(format!("tick interval out of range: {e}")))?;
        let summary_time = u8::try_from(sched.summary_hour)
            .ok()
            .zip(u8::try_from(sched.summary_minute).ok())
            .and_then(|(h, m)| RemindAt::new(h, m))
            .ok_or_else(|| NotifyError::Config("summary time out of range".to_owned()))?;

        Ok(Self {
            tasks: stores.tasks,
            subscriptions: stores.subscriptions,
            profiles: stores.profiles,
            ledger: stores.ledger,
            transport: None,
            tick_interval,
            push_timeout: config.push.timeout(),
            summary_time,
            max_concurrency: sched.max_concurrency,
            max_delivery_attempts: sched.max_delivery_attempts,
            ledger_retention: Duration::days(i64::from(sched.ledger_retention_days)),
            style: config.push.payload_style(),
            leader_lease: None,
            report_tx: None,
            retries: HashMap::new(),
            last_tick_at: None,
            last_prune_at: None,
        })
    }

    /// Attach the delivery channel.
    pub fn with_transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Enable single-leader scheduling via a lease controller.
    pub fn with_leader_lease(mut self, lease: LeaderLease) -> Self {
        self.leader_lease = Some(lease);
        self
    }

    /// Forward each tick's report to `tx`.
    pub fn with_report_channel(mut self, tx: mpsc::UnboundedSender<TickReport>) -> Self {
        self.report_tx = Some(tx);
        self
    }

    /// `true` when push delivery is enabled.
    #[must_use]
    pub fn delivery_enabled(&self) -> bool {
        self.transport.is_some()
    }

    /// Stages currently waiting for another delivery attempt.
    #[must_use]
    pub fn pending_retries(&self) -> Vec<LedgerKey> {
        self.retries.keys().cloned().collect()
    }

    /// Start the scheduler background loop.
    ///
    /// Cancellation is observed between ticks; a running tick completes.
    pub fn run(mut self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.tick_interval.num_seconds(),
                delivery = self.delivery_enabled(),
                "scheduler started"
            );
            let mut interval = tokio::time::interval(
                self.tick_interval
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(60)),
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("scheduler stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let now = Utc::now();
                        if self.should_execute_tick(now) {
                            self.tick_at(now).await;
                        }
                    }
                }
            }

            if let Some(lease) = self.leader_lease.as_ref()
                && let Err(e) = lease.release()
            {
                warn!("failed to release scheduler lease: {e}");
            }
        })
    }

    /// Lease check; always `true` without a lease.
    pub fn should_execute_tick(&self, now: DateTime<Utc>) -> bool {
        let Some(lease) = self.leader_lease.as_ref() else {
            return true;
        };

        match lease.try_acquire_or_renew_at(now) {
            Ok(LeadershipDecision::Leader { takeover }) => {
                if takeover {
                    info!("scheduler leadership acquired via takeover");
                }
                true
            }
            Ok(LeadershipDecision::Follower {
                leader_instance_id,
                lease_expires_at,
            }) => {
                debug!(
                    "scheduler tick skipped; leader is '{}' until {}",
                    leader_instance_id, lease_expires_at
                );
                false
            }
            Err(e) => {
                warn!("scheduler lease check failed, skipping tick: {e}");
                false
            }
        }
    }

    /// Run one tick at the current time.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as if the clock read `now`.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickReport {
        let window = self.window_ending_at(now);
        let ctx = TickContext::new(now, window);

        let tasks = Arc::clone(&self.tasks);
        match blocking(move || tasks.scan_all()).await {
            Ok(rows) => {
                ctx.tally(|r| r.tasks_scanned = rows.len());
                let this = &*self;
                let ctx_ref = &ctx;
                stream::iter(rows)
                    .for_each_concurrent(self.max_concurrency, |row| async move {
                        let task = match row {
                            Ok(task) => task,
                            Err(e) => {
                                warn!("skipping unreadable task record: {e}");
                                ctx_ref.tally(|r| r.task_errors += 1);
                                return;
                            }
                        };
                        let owner = task.owner.clone();
                        let task_id = task.id.clone();
                        if let Err(e) = this.process_task(ctx_ref, task).await {
                            warn!(%owner, %task_id, "task evaluation failed: {e}");
                            ctx_ref.tally(|r| r.task_errors += 1);
                        }
                    })
                    .await;
                self.send_summaries(&ctx).await;
            }
            Err(e) => {
                error!("task scan failed, skipping tick: {e}");
                ctx.tally(|r| r.scan_failed = true);
            }
        }

        let TickContext {
            report,
            next_retries,
            ..
        } = ctx;
        let report = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        if !report.scan_failed {
            self.retries = next_retries
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.last_tick_at = Some(now);
        self.maybe_prune_ledger(now).await;

        if report.is_quiet() {
            debug!(tasks = report.tasks_scanned, "scheduler tick complete");
        } else {
            info!(
                tasks = report.tasks_scanned,
                rollovers = report.rollovers,
                carried_forward = report.carried_forward,
                sent = report.notifications_sent,
                transient = report.transient_failures,
                pruned = report.subscriptions_pruned,
                errors = report.task_errors,
                "scheduler tick complete"
            );
        }

        if let Some(tx) = self.report_tx.as_ref()
            && tx.send(report.clone()).is_err()
        {
            debug!("tick report channel closed");
        }
        report
    }

    /// Deliver a `test` payload to every subscription of `owner` now,
    /// bypassing the ledger.
    pub async fn send_test_notification(&self, owner: &str) -> Result<DeliverySummary> {
        let transport = self.transport.as_deref().ok_or_else(|| {
            NotifyError::ConfigurationMissing("no push transport configured".to_owned())
        })?;
        let store = Arc::clone(&self.subscriptions);
        let owned = owner.to_owned();
        let subscriptions = blocking(move || store.list_by_owner(&owned)).await?;
        let payload = self.style.test();
        let summary = self
            .deliver_to_all(transport, &subscriptions, &payload)
            .await;
        info!(
            %owner,
            delivered = summary.delivered,
            pruned = summary.pruned.len(),
            "test notification sent"
        );
        Ok(summary)
    }

    /// Windows chain from the previous tick when it was recent, so a late
    /// tick leaves no gap. Otherwise the window is one interval long.
    fn window_ending_at(&self, now: DateTime<Utc>) -> TickWindow {
        match self.last_tick_at {
            Some(last) if last < now && now - last <= self.tick_interval * 2 => {
                TickWindow { start: last, end: now }
            }
            _ => TickWindow::ending_at(now, self.tick_interval),
        }
    }

    async fn process_task(&self, ctx: &TickContext, mut task: Task) -> Result<()> {
        let clock = self.owner_clock(ctx, &task.owner).await?;

        if let Some(fields) = stages::completion_rollover(&task, clock)? {
            if !self.write_rollover(&task, fields).await? {
                return Ok(());
            }
            info!(
                owner = %task.owner,
                task_id = %task.id,
                from = %task.next_due,
                to = %fields.next_due,
                "rolled completed task forward"
            );
            task.next_due = fields.next_due;
            task.priority = fields.priority;
            ctx.tally(|r| r.rollovers += 1);
        }

        if task.is_completed_on(clock.today, clock.offset) {
            return Ok(());
        }

        let subject = Subject::task(&task.owner, &task.id);
        let retrying: Vec<StageKey> = self
            .retries
            .keys()
            .filter(|k| k.subject == subject)
            .map(|k| k.stage.clone())
            .collect();
        let due = stages::due_stages(&task, clock, ctx.window, &retrying)?;
        let snapshot = task.clone();

        if let Some(fields) = stages::carry_forward(&task, clock, ctx.window)? {
            if !self.write_rollover(&task, fields).await? {
                return Ok(());
            }
            info!(
                owner = %task.owner,
                task_id = %task.id,
                missed = %task.next_due,
                "carried missed task forward"
            );
            task.next_due = fields.next_due;
            task.priority = fields.priority;
            ctx.tally(|r| r.carried_forward += 1);
        }

        for stage in due {
            let payload = match &stage {
                StageKey::HourBefore { .. } => self.style.hour_before(&snapshot),
                StageKey::Due { .. } => self.style.due(&snapshot),
                StageKey::Missed { .. } => self.style.missed(&task),
                StageKey::Summary { .. } => continue,
            };
            self.fire(ctx, &task.owner, LedgerKey::new(subject.clone(), stage), payload)
                .await?;
        }

        if stages::counts_toward_summary(&task, clock) {
            ctx.count_due_today(&task.owner);
        }
        Ok(())
    }

    async fn send_summaries(&self, ctx: &TickContext) {
        let owners: Vec<(String, OwnerClock, usize)> = lock(&ctx.owners)
            .iter()
            .filter(|(_, s)| s.due_today > 0)
            .map(|(owner, s)| (owner.clone(), s.clock, s.due_today))
            .collect();

        for (owner, clock, due_today) in owners {
            let key = LedgerKey::new(
                Subject::summary(&owner),
                StageKey::Summary { date: clock.today },
            );
            let retrying = self.retries.contains_key(&key);
            if !stages::summary_due(clock, self.summary_time, ctx.window, retrying) {
                continue;
            }
            let payload = self.style.daily_summary(due_today);
            if let Err(e) = self.fire(ctx, &owner, key, payload).await {
                warn!(%owner, "daily summary failed: {e}");
                ctx.tally(|r| r.task_errors += 1);
            }
        }
    }

    /// Timezone for `owner`: first valid subscription offset, then the
    /// profile, then UTC. Cached for the rest of the tick.
    async fn owner_clock(&self, ctx: &TickContext, owner: &str) -> Result<OwnerClock> {
        let cached = lock(&ctx.owners).get(owner).map(|s| s.clock);
        if let Some(clock) = cached {
            return Ok(clock);
        }

        let store = Arc::clone(&self.subscriptions);
        let profiles = Arc::clone(&self.profiles);
        let owned = owner.to_owned();
        let (subscriptions, offset) = blocking(move || {
            let subscriptions = store.list_by_owner(&owned)?;
            let offset = match subscriptions.iter().find_map(PushSubscription::tz_offset) {
                Some(offset) => offset,
                None => profiles.timezone_offset(&owned)?.unwrap_or(TzOffset::UTC),
            };
            Ok((subscriptions, offset))
        })
        .await?;

        let clock = OwnerClock::at(ctx.now, offset);
        let mut owners = lock(&ctx.owners);
        let state = owners.entry(owner.to_owned()).or_insert(OwnerState {
            clock,
            subscriptions,
            due_today: 0,
        });
        Ok(state.clock)
    }

    async fn write_rollover(&self, task: &Task, fields: RolloverFields) -> Result<bool> {
        let tasks = Arc::clone(&self.tasks);
        let (owner, id) = (task.owner.clone(), task.id.clone());
        let updated =
            blocking(move || tasks.update_rollover_fields(&owner, &id, fields)).await?;
        if !updated {
            debug!(owner = %task.owner, task_id = %task.id, "task vanished before rollover");
        }
        Ok(updated)
    }

    /// Send one stage unless the ledger already has it, then record it.
    async fn fire(
        &self,
        ctx: &TickContext,
        owner: &str,
        key: LedgerKey,
        payload: NotificationPayload,
    ) -> Result<()> {
        let Some(transport) = self.transport.as_deref() else {
            return Ok(());
        };

        let ledger = Arc::clone(&self.ledger);
        let lookup_key = key.clone();
        if blocking(move || ledger.was_sent(&lookup_key)).await? {
            debug!(%key, "stage already sent");
            ctx.tally(|r| r.duplicates_suppressed += 1);
            return Ok(());
        }

        let subscriptions = ctx.subscriptions_for(owner);
        let summary = self
            .deliver_to_all(transport, &subscriptions, &payload)
            .await;
        ctx.record_delivery(owner, &summary);

        if summary.should_mark_sent() {
            let ledger = Arc::clone(&self.ledger);
            let (sent_key, now) = (key.clone(), ctx.now);
            if !blocking(move || ledger.mark_sent(&sent_key, now)).await? {
                debug!(%key, "stage was marked concurrently");
            }
            if summary.delivered > 0 {
                debug!(%key, delivered = summary.delivered, "stage delivered");
            }
            return Ok(());
        }

        let attempts = self.retries.get(&key).copied().unwrap_or(0) + 1;
        if attempts >= self.max_delivery_attempts {
            warn!(%key, attempts, "giving up on stage after repeated transient failures");
        } else {
            debug!(%key, attempts, "stage will be retried next tick");
            lock(&ctx.next_retries).insert(key, attempts);
        }
        Ok(())
    }

    async fn deliver_to_all(
        &self,
        transport: &dyn PushTransport,
        subscriptions: &[PushSubscription],
        payload: &NotificationPayload,
    ) -> DeliverySummary {
        let mut summary = DeliverySummary::default();

        for subscription in subscriptions {
            let outcome =
                match tokio::time::timeout(self.push_timeout, transport.send(subscription, payload))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(DeliveryError::transient(format!(
                        "no response within {}s",
                        self.push_timeout.as_secs()
                    ))),
                };

            match outcome {
                Ok(()) => summary.delivered += 1,
                Err(e) if e.is_permanent() => {
                    summary.permanent += 1;
                    info!(
                        owner = %subscription.owner,
                        endpoint = %subscription.endpoint,
                        kind = payload.kind(),
                        "removing subscription: {e}"
                    );
                    let store = Arc::clone(&self.subscriptions);
                    let (owner, endpoint) =
                        (subscription.owner.clone(), subscription.endpoint.clone());
                    match blocking(move || store.remove(&owner, &endpoint)).await {
                        Ok(_) => summary.pruned.push(subscription.endpoint.clone()),
                        Err(err) => warn!(
                            owner = %subscription.owner,
                            endpoint = %subscription.endpoint,
                            "failed to remove dead subscription: {err}"
                        ),
                    }
                }
                Err(e) => {
                    summary.transient += 1;
                    warn!(
                        owner = %subscription.owner,
                        endpoint = %subscription.endpoint,
                        transport = transport.id(),
                        kind = payload.kind(),
                        "{e}"
                    );
                }
            }
        }

        summary
    }

    async fn maybe_prune_ledger(&mut self, now: DateTime<Utc>) {
        if self
            .last_prune_at
            .is_some_and(|at| now - at < Duration::hours(LEDGER_PRUNE_EVERY_HOURS))
        {
            return;
        }
        self.last_prune_at = Some(now);

        let ledger = Arc::clone(&self.ledger);
        let cutoff = now - self.ledger_retention;
        match blocking(move || ledger.prune_sent_before(cutoff)).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "pruned old ledger entries"),
            Err(e) => warn!("ledger prune failed: {e}"),
        }
    }
}
