//! Single-leader lease for running several scheduler instances.
//!
//! The ledger already prevents duplicate sends, but only one instance
//! should be paying for scans and rollovers. The holder of a file lease
//! ticks; everyone else idles until the lease expires.

use crate::config::LeaseConfig;
use crate::error::{NotifyError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;

/// Longer leases are clamped.
const MAX_LEASE_TTL_SECS: u64 = 24 * 60 * 60;

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipDecision {
    /// This instance holds the lease.
    Leader {
        /// `true` when the lease was taken over from an expired peer.
        takeover: bool,
    },
    /// Another instance holds the lease.
    Follower {
        leader_instance_id: String,
        lease_expires_at: DateTime<Utc>,
    },
}

impl LeadershipDecision {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }
}

/// What the lease file holds: who leads and until when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    instance_id: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    renewed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_held_by(&self, instance_id: &str) -> bool {
        self.instance_id == instance_id
    }

    fn has_lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The on-disk home of a [`LeaseRecord`].
///
/// Replacement goes through a per-process sibling file and a rename, so a
/// reader sees either the old record or the new one. Unreadable contents
/// count as a vacant lease.
#[derive(Debug, Clone)]
struct LeaseFile {
    path: PathBuf,
}

impl LeaseFile {
    fn load(&self) -> Result<Option<LeaseRecord>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(lease_error("read", e)),
        };
        Ok(serde_json::from_slice(&bytes)
            .inspect_err(|e| {
                tracing::warn!(
                    path = %self.path.display(),
                    "treating unreadable lease as vacant: {e}"
                );
            })
            .ok())
    }

    fn store(&self, record: &LeaseRecord) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| lease_error("create directory for", e))?;
        }
        let staged = self.staging_path(record.pid);
        let json = serde_json::to_vec(record).map_err(|e| lease_error("encode", e))?;
        std::fs::write(&staged, json).map_err(|e| lease_error("stage", e))?;
        std::fs::rename(&staged, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&staged);
            lease_error("replace", e)
        })
    }

    /// Remove the file if `instance_id` is the current holder.
    fn clear_if_held_by(&self, instance_id: &str) -> Result<bool> {
        if !self.load()?.is_some_and(|r| r.is_held_by(instance_id)) {
            return Ok(false);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(lease_error("release", e)),
        }
    }

    fn staging_path(&self, pid: u32) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{pid}.staged"));
        self.path.with_file_name(name)
    }
}

fn lease_error(action: &str, e: impl std::fmt::Display) -> NotifyError {
    NotifyError::Scheduler(format!("failed to {action} scheduler lease: {e}"))
}

/// File-backed leader lease.
#[derive(Debug, Clone)]
pub struct LeaderLease {
    instance_id: String,
    pid: u32,
    file: LeaseFile,
    ttl: Duration,
}

impl LeaderLease {
    #[must_use]
    pub fn new(instance_id: impl Into<String>, path: PathBuf, ttl: Duration) -> Self {
        Self {
            instance_id: instance_id.into(),
            pid: std::process::id(),
            file: LeaseFile { path },
            ttl,
        }
    }

    /// Lease for this process with a random instance id.
    #[must_use]
    pub fn from_config(config: &LeaseConfig) -> Self {
        let ttl = Duration::seconds(config.ttl_secs.min(MAX_LEASE_TTL_SECS) as i64);
        Self::new(uuid::Uuid::new_v4().to_string(), config.path.clone(), ttl)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Acquire, renew, or observe the lease at `now`.
    pub fn try_acquire_or_renew_at(&self, now: DateTime<Utc>) -> Result<LeadershipDecision> {
        let current = self.file.load()?;
        let (acquired_at, takeover) = match current {
            Some(held) if held.is_held_by(&self.instance_id) => (held.acquired_at, false),
            Some(held) if !held.has_lapsed_at(now) => {
                return Ok(LeadershipDecision::Follower {
                    leader_instance_id: held.instance_id,
                    lease_expires_at: held.expires_at,
                });
            }
            Some(_) => (now, true),
            None => (now, false),
        };

        self.file.store(&LeaseRecord {
            instance_id: self.instance_id.clone(),
            pid: self.pid,
            acquired_at,
            renewed_at: now,
            expires_at: now + self.ttl,
        })?;
        Ok(LeadershipDecision::Leader { takeover })
    }

    /// Drop the lease if this instance holds it. A peer's lease is left alone.
    pub fn release(&self) -> Result<()> {
        if self.file.clear_if_held_by(&self.instance_id)? {
            tracing::debug!(instance_id = %self.instance_id, "scheduler lease released");
        }
        Ok(())
    }
}
