//! TickTock: reminder notifications for recurring tasks.
//!
//! A background scheduler scans recurring tasks once a minute and delivers
//! Web Push reminders to each owner's registered browsers:
//! - **Hour-before** and **due-time** reminders, computed in the owner's
//!   local timezone
//! - **Missed** notices that carry an unresolved occurrence forward to today
//! - A once-daily **summary** of what is still due today
//!
//! Every stage is recorded in an idempotency ledger so it is sent at most
//! once, even across restarts.

pub mod config;
pub mod error;
pub mod push;
pub mod scheduler;
pub mod store;
pub mod time_math;

pub use config::NotifierConfig;
pub use error::{NotifyError, Result};
pub use push::{DeliveryError, NotificationPayload, PushTransport, WebPushTransport};
pub use scheduler::{Scheduler, TickReport};
pub use store::{MemoryLedger, MemoryStore, SqliteStore, StoreHandles};
