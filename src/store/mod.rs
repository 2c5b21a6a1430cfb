//! Storage contracts consumed by the scheduler.
//!
//! The scheduler only needs a narrow slice of each collaborator: a full task
//! scan plus a targeted rollover write, per-owner subscription listing and
//! removal, and a profile-level timezone lookup. [`memory`] provides
//! in-process implementations; [`sqlite`] provides the durable one.

pub mod memory;
mod schema;
pub mod sqlite;

use std::sync::Arc;

use crate::error::Result;
use crate::scheduler::ledger::IdempotencyLedger;
use crate::scheduler::tasks::{PushSubscription, RolloverFields, Task};
use crate::time_math::TzOffset;

pub use memory::{MemoryLedger, MemoryStore};
pub use sqlite::SqliteStore;

/// Durable collection of task records keyed by `(owner, id)`.
pub trait TaskStore: Send + Sync {
    /// Snapshot of every task, one entry per stored record.
    ///
    /// The outer error means the store itself failed. A record that cannot
    /// be decoded is returned as its own `Err` so the rest still load.
    fn scan_all(&self) -> Result<Vec<Result<Task>>>;

    /// Tasks belonging to one owner.
    fn list_by_owner(&self, owner: &str) -> Result<Vec<Task>>;

    /// Overwrite only `next_due` and `priority`. Returns `false` if the task
    /// no longer exists.
    fn update_rollover_fields(&self, owner: &str, id: &str, fields: RolloverFields)
    -> Result<bool>;
}

/// Durable collection of push endpoints per owner.
pub trait SubscriptionStore: Send + Sync {
    fn list_by_owner(&self, owner: &str) -> Result<Vec<PushSubscription>>;

    /// Remove one endpoint. Returns `false` if it was already gone.
    fn remove(&self, owner: &str, endpoint: &str) -> Result<bool>;
}

/// Owner profile lookups (fallback timezone source).
pub trait ProfileStore: Send + Sync {
    /// Offset stored on the owner's profile, if any.
    fn timezone_offset(&self, owner: &str) -> Result<Option<TzOffset>>;
}

/// The four collaborators the scheduler reads and writes.
#[derive(Clone)]
pub struct StoreHandles {
    pub tasks: Arc<dyn TaskStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub ledger: Arc<dyn IdempotencyLedger>,
}

impl StoreHandles {
    /// Use one backend for everything, e.g. a [`SqliteStore`].
    pub fn unified<S>(store: Arc<S>) -> Self
    where
        S: TaskStore + SubscriptionStore + ProfileStore + IdempotencyLedger + 'static,
    {
        Self {
            tasks: store.clone(),
            subscriptions: store.clone(),
            profiles: store.clone(),
            ledger: store,
        }
    }

    /// In-process stores with a separate ledger.
    pub fn in_memory(store: Arc<MemoryStore>, ledger: Arc<MemoryLedger>) -> Self {
        Self {
            tasks: store.clone(),
            subscriptions: store.clone(),
            profiles: store,
            ledger,
        }
    }
}
