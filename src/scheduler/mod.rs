//! Recurring-task reminder scheduler.
//!
//! A periodic tick evaluates every task against its owner's local clock,
//! rolls completed and missed occurrences forward, and sends hour-before,
//! due-time, missed, and daily-summary notifications exactly once each.

pub mod authority;
pub mod ledger;
pub mod runner;
pub mod stages;
pub mod tasks;

pub use authority::{LeaderLease, LeadershipDecision};
pub use ledger::{IdempotencyLedger, LedgerKey, StageKey, Subject};
pub use runner::{DeliverySummary, Scheduler, TickReport};
pub use tasks::{Occurrence, PushSubscription, Recurrence, SubscriptionKeys, Task};
