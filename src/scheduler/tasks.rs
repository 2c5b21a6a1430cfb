//! Reminder task and push subscription records.
//!
//! Defines [`Task`] (one recurring task with its single pending
//! occurrence), [`Recurrence`], and [`PushSubscription`].

use crate::error::{NotifyError, Result};
use crate::time_math::{self, RemindAt, TzOffset, WeekdaySet};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// How a task repeats.
///
/// A non-empty `schedule_days` takes precedence over `every_days`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurrence {
    /// Fixed interval in days (at least 1).
    pub every_days: u32,
    /// Custom weekly pattern, Sunday = 0.
    #[serde(default)]
    pub schedule_days: WeekdaySet,
}

impl Recurrence {
    /// Repeat every `days` days.
    #[must_use]
    pub fn every(days: u32) -> Self {
        Self {
            every_days: days.max(1),
            schedule_days: WeekdaySet::EMPTY,
        }
    }

    /// Repeat on the given weekdays.
    #[must_use]
    pub fn weekly(days: WeekdaySet) -> Self {
        Self {
            every_days: 7,
            schedule_days: days,
        }
    }

    /// First scheduled date strictly after `from`, if it is representable.
    #[must_use]
    pub fn next_after(&self, from: NaiveDate) -> Option<NaiveDate> {
        time_math::next_scheduled_date(from, self.every_days, self.schedule_days)
    }

    /// Short human description used in notification bodies.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.schedule_days.is_empty() {
            format!("Every {} day(s)", self.every_days.max(1))
        } else {
            format!("Every {}", self.schedule_days)
        }
    }
}

/// A recurring task with exactly one pending occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Identifier, unique per owner.
    pub id: String,
    /// Owning user.
    pub owner: String,
    pub title: String,
    #[serde(default)]
    pub notes: String,
    #[serde(flatten)]
    pub recurrence: Recurrence,
    /// Date of the pending occurrence, in the owner's local calendar.
    pub next_due: NaiveDate,
    /// Local time-of-day the occurrence is due.
    pub remind_at: RemindAt,
    /// Set when a missed occurrence was carried forward.
    #[serde(default)]
    pub priority: bool,
    /// When the owner last marked the task done.
    #[serde(default)]
    pub last_completed: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task due on `next_due` at `remind_at`.
    pub fn new(
        owner: impl Into<String>,
        id: impl Into<String>,
        title: impl Into<String>,
        recurrence: Recurrence,
        next_due: NaiveDate,
        remind_at: RemindAt,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            title: title.into(),
            notes: String::new(),
            recurrence,
            next_due,
            remind_at,
            priority: false,
            last_completed: None,
        }
    }

    /// Identity of the pending occurrence.
    #[must_use]
    pub fn occurrence(&self) -> Occurrence {
        Occurrence {
            next_due: self.next_due,
            remind_at: self.remind_at,
        }
    }

    /// Absolute instant the pending occurrence is due for an owner at `offset`.
    pub fn due_instant(&self, offset: TzOffset) -> Result<DateTime<Utc>> {
        time_math::due_instant(self.next_due, self.remind_at, offset).ok_or_else(|| {
            NotifyError::InvalidTask(format!(
                "{}/{}: due date {} at {} is out of range",
                self.owner, self.id, self.next_due, self.remind_at
            ))
        })
    }

    /// Owner-local date of the last completion, if any.
    #[must_use]
    pub fn completed_on(&self, offset: TzOffset) -> Option<NaiveDate> {
        self.last_completed
            .map(|at| time_math::local_calendar_date(at, offset))
    }

    /// `true` if the owner completed the task on `today` (their local date).
    #[must_use]
    pub fn is_completed_on(&self, today: NaiveDate, offset: TzOffset) -> bool {
        self.completed_on(offset) == Some(today)
    }

    /// Prefix notification bodies with the task notes, if any.
    pub(crate) fn body_with_notes(&self, text: &str) -> String {
        let notes = self.notes.trim();
        if notes.is_empty() {
            text.to_owned()
        } else {
            format!("{notes}\n{text}")
        }
    }
}

/// Identity of one occurrence of a task: `(next_due, remind_at)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub next_due: NaiveDate,
    pub remind_at: RemindAt,
}

impl std::fmt::Display for Occurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}T{}", self.next_due, self.remind_at)
    }
}

/// Fields the scheduler is allowed to write back to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverFields {
    pub next_due: NaiveDate,
    pub priority: bool,
}

/// Encryption keys handed out by the browser push manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    /// Client public key (base64url, uncompressed P-256 point).
    pub p256dh: String,
    /// Client auth secret (base64url).
    pub auth: String,
}

/// One push endpoint registered by an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub owner: String,
    /// Push service URL, unique per owner.
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    /// Offset the client reported when it subscribed.
    #[serde(default)]
    pub tz_offset_minutes: Option<i32>,
}

impl PushSubscription {
    pub fn new(
        owner: impl Into<String>,
        endpoint: impl Into<String>,
        keys: SubscriptionKeys,
    ) -> Self {
        Self {
            owner: owner.into(),
            endpoint: endpoint.into(),
            keys,
            tz_offset_minutes: None,
        }
    }

    /// Attach a client-reported timezone offset.
    #[must_use]
    pub fn with_tz_offset(mut self, minutes: i32) -> Self {
        self.tz_offset_minutes = Some(minutes);
        self
    }

    /// Reported offset, when present and in range.
    #[must_use]
    pub fn tz_offset(&self) -> Option<TzOffset> {
        self.tz_offset_minutes.and_then(TzOffset::from_minutes)
    }
}
