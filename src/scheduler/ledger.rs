//! Idempotency ledger keys and contract.
//!
//! A [`LedgerKey`] names one notification stage of one occurrence. Keys are
//! structured values: a new occurrence (or a new carry-forward date, or a new
//! summary day) is simply a different key, so nothing ever has to be reset.

use crate::error::{NotifyError, Result};
use crate::scheduler::tasks::Occurrence;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who a ledger entry is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    /// A single task of an owner.
    Task { owner: String, task_id: String },
    /// The owner's once-daily summary.
    OwnerSummary { owner: String },
}

impl Subject {
    pub fn task(owner: &str, task_id: &str) -> Self {
        Self::Task {
            owner: owner.to_owned(),
            task_id: task_id.to_owned(),
        }
    }

    pub fn summary(owner: &str) -> Self {
        Self::OwnerSummary {
            owner: owner.to_owned(),
        }
    }
}

/// Which stage was sent, and for which occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageKey {
    /// One hour before the due instant.
    HourBefore { occurrence: Occurrence },
    /// At the due instant.
    Due { occurrence: Occurrence },
    /// Occurrence was missed and carried forward to `rolled_to`.
    Missed {
        occurrence: Occurrence,
        rolled_to: NaiveDate,
    },
    /// Owner digest for a local calendar day.
    Summary { date: NaiveDate },
}

impl StageKey {
    /// Short stage name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::HourBefore { .. } => "1h",
            Self::Due { .. } => "due",
            Self::Missed { .. } => "missed",
            Self::Summary { .. } => "summary",
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HourBefore { occurrence } => write!(f, "{occurrence}|1h"),
            Self::Due { occurrence } => write!(f, "{occurrence}|due"),
            Self::Missed {
                occurrence,
                rolled_to,
            } => write!(f, "{occurrence}|missed|{rolled_to}"),
            Self::Summary { date } => write!(f, "summary|{date}"),
        }
    }
}

/// Composite identity of one sent notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub subject: Subject,
    pub stage: StageKey,
}

impl LedgerKey {
    pub fn new(subject: Subject, stage: StageKey) -> Self {
        Self { subject, stage }
    }

    /// Canonical storage encoding of the subject.
    ///
    /// JSON keeps owner and task ids in separate fields, so ids containing
    /// `|` or `:` can never collide.
    pub fn subject_column(&self) -> Result<String> {
        encode(&self.subject)
    }

    /// Canonical storage encoding of the stage.
    pub fn stage_column(&self) -> Result<String> {
        encode(&self.stage)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        NotifyError::StoreUnavailable(format!("cannot encode ledger key: {e}"))
    })
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Subject::Task { owner, task_id } => write!(f, "{owner}/{task_id}:{}", self.stage),
            Subject::OwnerSummary { owner } => write!(f, "{owner}:{}", self.stage),
        }
    }
}

/// Durable record of which stages were already sent.
///
/// Once a key is marked it is never reported unsent again (until pruned).
pub trait IdempotencyLedger: Send + Sync {
    /// `true` if `key` was marked sent.
    fn was_sent(&self, key: &LedgerKey) -> Result<bool>;

    /// Record `key` as sent at `sent_at`. Returns `true` when newly inserted;
    /// marking an existing key is a no-op returning `false`.
    fn mark_sent(&self, key: &LedgerKey, sent_at: DateTime<Utc>) -> Result<bool>;

    /// Drop entries sent before `cutoff`. Returns how many were removed.
    fn prune_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::time_math::RemindAt;

    fn occurrence() -> Occurrence {
        Occurrence {
            next_due: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            remind_at: RemindAt::new(9, 0).unwrap(),
        }
    }

    #[test]
    fn display_mirrors_stage_names() {
        let key = LedgerKey::new(
            Subject::task("alice", "t1"),
            StageKey::HourBefore {
                occurrence: occurrence(),
            },
        );
        assert_eq!(key.to_string(), "alice/t1:2025-03-10T09:00|1h");

        let missed = StageKey::Missed {
            occurrence: occurrence(),
            rolled_to: NaiveDate::from_ymd_opt(2025, 3, 11).unwrap(),
        };
        assert_eq!(missed.to_string(), "2025-03-10T09:00|missed|2025-03-11");
        assert_eq!(missed.name(), "missed");
    }

    #[test]
    fn delimiter_in_ids_does_not_collide() {
        let a = LedgerKey::new(
            Subject::task("a|b", "c"),
            StageKey::Due {
                occurrence: occurrence(),
            },
        );
        let b = LedgerKey::new(
            Subject::task("a", "b|c"),
            StageKey::Due {
                occurrence: occurrence(),
            },
        );
        assert_ne!(a, b);
        assert_ne!(a.subject_column().unwrap(), b.subject_column().unwrap());
    }

    #[test]
    fn columns_are_stable() {
        let key = LedgerKey::new(
            Subject::summary("alice"),
            StageKey::Summary {
                date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            },
        );
        assert_eq!(
            key.subject_column().unwrap(),
            r#"{"kind":"owner_summary","owner":"alice"}"#
        );
        assert_eq!(
            key.stage_column().unwrap(),
            r#"{"stage":"summary","date":"2025-06-01"}"#
        );
    }
}
