//! Per-task stage evaluation.
//!
//! Nothing here touches a store or the network. Given a task snapshot, the
//! owner's clock, and the tick's lookback window, these functions decide
//! which rollover write applies and which notification stages are due. The
//! runner performs the side effects.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::{NotifyError, Result};
use crate::scheduler::ledger::StageKey;
use crate::scheduler::tasks::{RolloverFields, Task};
use crate::time_math::{self, RemindAt, TzOffset};

/// Lookback interval `(start, end]` covered by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TickWindow {
    /// Window of length `len` ending at `now`.
    #[must_use]
    pub fn ending_at(now: DateTime<Utc>, len: Duration) -> Self {
        Self {
            start: now - len,
            end: now,
        }
    }

    /// `true` if `instant` lies in `(start, end]`.
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant > self.start && instant <= self.end
    }
}

/// An owner's offset and local date at tick time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerClock {
    pub offset: TzOffset,
    pub today: NaiveDate,
}

impl OwnerClock {
    #[must_use]
    pub fn at(now: DateTime<Utc>, offset: TzOffset) -> Self {
        Self {
            offset,
            today: time_math::local_calendar_date(now, offset),
        }
    }

    /// Absolute instant of `time` on the owner's current local date.
    #[must_use]
    pub fn today_at(&self, time: RemindAt) -> Option<DateTime<Utc>> {
        time_math::due_instant(self.today, time, self.offset)
    }
}

/// Advance `next_due` past a completion recorded on an earlier local day.
///
/// Returns `None` once `next_due` is already later than the completion
/// date, so repeated evaluation never advances twice. Fails when the next
/// scheduled date would leave the calendar range.
pub fn completion_rollover(task: &Task, clock: OwnerClock) -> Result<Option<RolloverFields>> {
    let Some(completed) = task.completed_on(clock.offset) else {
        return Ok(None);
    };
    if completed >= clock.today || task.next_due > completed {
        return Ok(None);
    }
    let next_due = task.recurrence.next_after(completed).ok_or_else(|| {
        NotifyError::InvalidTask(format!(
            "{}/{}: no date after {completed} for {}",
            task.owner,
            task.id,
            task.recurrence.describe()
        ))
    })?;
    Ok(Some(RolloverFields {
        next_due,
        priority: false,
    }))
}

/// The pending occurrence was never resolved and its due instant has left
/// the lookback window.
pub fn is_missed(task: &Task, clock: OwnerClock, window: TickWindow) -> Result<bool> {
    if task.next_due >= clock.today {
        return Ok(false);
    }
    Ok(task.due_instant(clock.offset)? <= window.start)
}

/// Carry a missed occurrence forward to the owner's current local date.
pub fn carry_forward(
    task: &Task,
    clock: OwnerClock,
    window: TickWindow,
) -> Result<Option<RolloverFields>> {
    Ok(is_missed(task, clock, window)?.then_some(RolloverFields {
        next_due: clock.today,
        priority: true,
    }))
}

/// Notification stages eligible for `task` in this tick.
///
/// `retrying` holds this task's stages whose last delivery failed
/// transiently; they stay eligible outside the window while they still make
/// sense for the current occurrence. The caller has already skipped tasks
/// completed today and applied any completion rollover.
pub fn due_stages(
    task: &Task,
    clock: OwnerClock,
    window: TickWindow,
    retrying: &[StageKey],
) -> Result<Vec<StageKey>> {
    let occurrence = task.occurrence();
    let due = task.due_instant(clock.offset)?;
    let now = window.end;
    let mut stages = Vec::new();

    let hour_key = StageKey::HourBefore { occurrence };
    if let Some(hour_before) = due.checked_sub_signed(Duration::hours(1)) {
        let hour_retry = retrying.contains(&hour_key) && hour_before <= now;
        if (window.contains(hour_before) || hour_retry) && now < due {
            stages.push(hour_key);
        }
    }

    let due_key = StageKey::Due { occurrence };
    if window.contains(due) || (retrying.contains(&due_key) && due <= now) {
        stages.push(due_key);
    }

    if is_missed(task, clock, window)? {
        stages.push(StageKey::Missed {
            occurrence,
            rolled_to: clock.today,
        });
    } else if task.next_due == clock.today {
        // Already carried forward earlier; resend a notice that failed.
        stages.extend(
            retrying
                .iter()
                .filter(|k| {
                    matches!(k, StageKey::Missed { rolled_to, .. } if *rolled_to == clock.today)
                })
                .cloned(),
        );
    }

    Ok(stages)
}

/// `true` when the owner's daily digest for `clock.today` should go out now.
#[must_use]
pub fn summary_due(
    clock: OwnerClock,
    summary_time: RemindAt,
    window: TickWindow,
    retrying: bool,
) -> bool {
    clock
        .today_at(summary_time)
        .is_some_and(|at| window.contains(at) || (retrying && at <= window.end))
}

/// Counts toward the daily digest: due today and not completed today.
#[must_use]
pub fn counts_toward_summary(task: &Task, clock: OwnerClock) -> bool {
    task.next_due == clock.today && !task.is_completed_on(clock.today, clock.offset)
}
