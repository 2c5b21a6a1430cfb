//! Configuration types for the reminder engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NotifyError, Result};
use crate::push::PayloadStyle;

/// Environment variable carrying the VAPID public key.
pub const ENV_VAPID_PUBLIC_KEY: &str = "WEB_PUSH_PUBLIC_KEY";
/// Environment variable carrying the VAPID private key.
pub const ENV_VAPID_PRIVATE_KEY: &str = "WEB_PUSH_PRIVATE_KEY";
/// Overrides [`default_data_dir`].
pub const ENV_DATA_DIR: &str = "TICKTOCK_DATA_DIR";

const MAX_TICK_INTERVAL_SECS: u64 = 24 * 60 * 60;
const MAX_LEDGER_RETENTION_DAYS: u32 = 3650;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Tick cadence and stage timing.
    pub scheduler: SchedulerConfig,
    /// Web Push credentials and payload styling.
    pub push: PushConfig,
    /// Persistent storage.
    pub store: StoreConfig,
    /// Single-leader lease for multi-instance deployments.
    pub lease: LeaseConfig,
}

/// Scheduler loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between ticks. Also the lookback window length.
    pub tick_interval_secs: u64,
    /// Local hour the daily summary goes out.
    pub summary_hour: u32,
    /// Local minute the daily summary goes out.
    pub summary_minute: u32,
    /// Upper bound on tasks processed concurrently within a tick.
    pub max_concurrency: usize,
    /// Ticks a transiently failing stage is retried before giving up.
    pub max_delivery_attempts: u32,
    /// Ledger entries older than this are pruned.
    pub ledger_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            summary_hour: 8,
            summary_minute: 0,
            max_concurrency: 8,
            max_delivery_attempts: 3,
            ledger_retention_days: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }
}

/// Web Push settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// VAPID public key (base64url, uncompressed P-256 point).
    pub vapid_public_key: Option<String>,
    /// VAPID private key (base64url, raw 32-byte scalar).
    pub vapid_private_key: Option<String>,
    /// VAPID `sub` claim, a `mailto:` or `https:` contact.
    pub subject: String,
    /// Per-delivery HTTP timeout.
    pub timeout_secs: u64,
    /// How long the push service may hold an undelivered message.
    pub ttl_secs: u32,
    /// Icon path placed in every payload.
    pub icon: String,
    /// Badge path placed in every payload.
    pub badge: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        let style = PayloadStyle::default();
        Self {
            vapid_public_key: None,
            vapid_private_key: None,
            subject: "mailto:admin@example.com".to_owned(),
            timeout_secs: 10,
            ttl_secs: 86_400,
            icon: style.icon,
            badge: style.badge,
        }
    }
}

impl PushConfig {
    /// `true` when both VAPID keys are present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        let present = |k: &Option<String>| k.as_deref().is_some_and(|v| !v.trim().is_empty());
        present(&self.vapid_public_key) && present(&self.vapid_private_key)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn payload_style(&self) -> PayloadStyle {
        PayloadStyle {
            icon: self.icon.clone(),
            badge: self.badge.clone(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("ticktock.db"),
        }
    }
}

/// Leader lease settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Only the lease holder ticks when enabled.
    pub enabled: bool,
    /// Shared lease file.
    pub path: PathBuf,
    /// Seconds a lease stays valid without renewal.
    pub ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_data_dir().join("scheduler.leader.lock"),
            ttl_secs: 15,
        }
    }
}

impl NotifierConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| NotifyError::Config(e.to_string()))
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| NotifyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/ticktock/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("ticktock").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("ticktock")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/ticktock-config/config.toml")
        }
    }

    /// Apply `WEB_PUSH_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty(ENV_VAPID_PUBLIC_KEY) {
            self.push.vapid_public_key = Some(key);
        }
        if let Some(key) = non_empty(ENV_VAPID_PRIVATE_KEY) {
            self.push.vapid_private_key = Some(key);
        }
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.tick_interval_secs == 0 || s.tick_interval_secs > MAX_TICK_INTERVAL_SECS {
            return Err(NotifyError::Config(format!(
                "scheduler.tick_interval_secs must be in 1..={MAX_TICK_INTERVAL_SECS}"
            )));
        }
        if s.max_concurrency == 0 {
            return Err(NotifyError::Config(
                "scheduler.max_concurrency must be > 0".to_owned(),
            ));
        }
        if s.summary_hour > 23 || s.summary_minute > 59 {
            return Err(NotifyError::Config(format!(
                "summary time {:02}:{:02} is out of range",
                s.summary_hour, s.summary_minute
            )));
        }
        if s.ledger_retention_days == 0 || s.ledger_retention_days > MAX_LEDGER_RETENTION_DAYS {
            return Err(NotifyError::Config(format!(
                "scheduler.ledger_retention_days must be in 1..={MAX_LEDGER_RETENTION_DAYS}"
            )));
        }
        if self.push.timeout_secs == 0 {
            return Err(NotifyError::Config("push.timeout_secs must be > 0".to_owned()));
        }
        if self.lease.enabled && self.lease.ttl_secs == 0 {
            return Err(NotifyError::Config("lease.ttl_secs must be > 0".to_owned()));
        }
        Ok(())
    }
}

/// Application data root: `dirs::data_dir()/ticktock`, or `$TICKTOCK_DATA_DIR`.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("ticktock"))
        .unwrap_or_else(|| PathBuf::from("/tmp/ticktock-data"))
}
