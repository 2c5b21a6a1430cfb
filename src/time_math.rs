//! Calendar arithmetic for task occurrences.
//!
//! Everything here is pure: local dates and times-of-day are projected to
//! absolute instants through an explicit [`TzOffset`], never through the
//! server's own timezone.

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Westernmost offset accepted from clients (UTC-12:00), in minutes.
pub const MIN_OFFSET_MINUTES: i32 = -12 * 60;

/// Easternmost offset accepted from clients (UTC+14:00), in minutes.
pub const MAX_OFFSET_MINUTES: i32 = 14 * 60;

/// Fixed offset from UTC in minutes, positive east of Greenwich.
///
/// `-300` is UTC-5, `330` is UTC+5:30.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TzOffset(i32);

impl TzOffset {
    /// UTC itself.
    pub const UTC: Self = Self(0);

    /// Returns `None` when `minutes` lies outside the real-world offset range.
    #[must_use]
    pub fn from_minutes(minutes: i32) -> Option<Self> {
        (MIN_OFFSET_MINUTES..=MAX_OFFSET_MINUTES)
            .contains(&minutes)
            .then_some(Self(minutes))
    }

    /// Offset in minutes east of UTC.
    #[must_use]
    pub fn minutes(self) -> i32 {
        self.0
    }

    fn as_duration(self) -> Duration {
        Duration::minutes(i64::from(self.0))
    }
}

impl fmt::Display for TzOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { '-' } else { '+' };
        let abs = self.0.unsigned_abs();
        write!(f, "UTC{sign}{:02}:{:02}", abs / 60, abs % 60)
    }
}

/// Local time-of-day a reminder is due, serialized as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemindAt {
    hour: u8,
    minute: u8,
}

impl RemindAt {
    /// Returns `None` unless `hour < 24` and `minute < 60`.
    #[must_use]
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    #[must_use]
    pub fn hour(self) -> u8 {
        self.hour
    }

    #[must_use]
    pub fn minute(self) -> u8 {
        self.minute
    }

    /// Time-of-day as a chrono value.
    #[must_use]
    pub fn as_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for RemindAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for RemindAt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
        let hour = h.parse::<u8>().map_err(|e| format!("bad hour in {s:?}: {e}"))?;
        let minute = m.parse::<u8>().map_err(|e| format!("bad minute in {s:?}: {e}"))?;
        Self::new(hour, minute).ok_or_else(|| format!("time of day out of range: {s:?}"))
    }
}

impl TryFrom<String> for RemindAt {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RemindAt> for String {
    fn from(value: RemindAt) -> Self {
        value.to_string()
    }
}

/// Set of weekdays, Sunday = 0 through Saturday = 6, serialized as a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    /// The empty set: no custom weekly pattern.
    pub const EMPTY: Self = Self(0);

    /// Build a set from weekday numbers. Fails on anything outside `0..=6`.
    pub fn from_days(days: impl IntoIterator<Item = u8>) -> Result<Self, String> {
        let mut bits = 0_u8;
        for day in days {
            if day > 6 {
                return Err(format!("weekday out of range (0-6): {day}"));
            }
            bits |= 1 << day;
        }
        Ok(Self(bits))
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, weekday: u8) -> bool {
        weekday <= 6 && self.0 & (1 << weekday) != 0
    }

    /// Member weekdays in ascending order.
    pub fn days(self) -> impl Iterator<Item = u8> {
        (0..=6_u8).filter(move |d| self.contains(*d))
    }
}

impl TryFrom<Vec<u8>> for WeekdaySet {
    type Error = String;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_days(value)
    }
}

impl From<WeekdaySet> for Vec<u8> {
    fn from(value: WeekdaySet) -> Self {
        value.days().collect()
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
        let names: Vec<&str> = self.days().map(|d| NAMES[usize::from(d)]).collect();
        f.write_str(&names.join(", "))
    }
}

/// Interpret `next_due` at `remind_at` as wall-clock time at `offset` and
/// return the matching UTC instant.
///
/// `None` when the instant falls outside chrono's representable range.
#[must_use]
pub fn due_instant(
    next_due: NaiveDate,
    remind_at: RemindAt,
    offset: TzOffset,
) -> Option<DateTime<Utc>> {
    next_due
        .and_time(remind_at.as_naive_time())
        .checked_sub_signed(offset.as_duration())
        .map(|utc| utc.and_utc())
}

/// Calendar date an owner at `offset` sees at `instant`.
///
/// Saturates to the UTC date at the very edge of the calendar range.
#[must_use]
pub fn local_calendar_date(instant: DateTime<Utc>, offset: TzOffset) -> NaiveDate {
    let utc = instant.naive_utc();
    utc.checked_add_signed(offset.as_duration())
        .unwrap_or(utc)
        .date()
}

/// Weekday of an owner-local calendar date, Sunday = 0.
#[must_use]
pub fn weekday_of_local_date(date: NaiveDate) -> u8 {
    // num_days_from_sunday is always 0..=6
    date.weekday().num_days_from_sunday() as u8
}

/// Next date an occurrence is scheduled for, strictly after `from`.
///
/// A non-empty `schedule_days` wins: the first of the following seven days
/// whose weekday is in the set. Otherwise `from + every_days` (at least one).
/// `None` when the result would leave the calendar range.
#[must_use]
pub fn next_scheduled_date(
    from: NaiveDate,
    every_days: u32,
    schedule_days: WeekdaySet,
) -> Option<NaiveDate> {
    if !schedule_days.is_empty() {
        return (1..=7)
            .map_while(|step| from.checked_add_days(Days::new(step)))
            .find(|candidate| schedule_days.contains(weekday_of_local_date(*candidate)));
    }
    from.checked_add_days(Days::new(u64::from(every_days.max(1))))
}
