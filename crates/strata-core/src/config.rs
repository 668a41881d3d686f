//! Construction-time configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Result, StrataError};
use crate::ports::QueueAttributes;
use crate::task::KeepAlivePolicy;

/// Lease granted to a retrieved task when the caller does not pick one.
pub const DEFAULT_LEASE_SECS: u64 = 180;

/// 14 days, the longest retention the hosted service allows.
pub const DEFAULT_RETENTION_SECS: u64 = 1_209_600;

pub const MIN_RETENTION_SECS: u64 = 60;

/// Longest lease the hosted service accepts (12 hours).
pub const MAX_LEASE_SECS: u64 = 43_200;

/// How often the floor monitor re-reads queue depths.
pub const DEFAULT_MONITOR_POLL_SECS: u64 = 300;

pub const MAX_PRIORITY_LEVELS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub default_lease_secs: u64,
    pub retention_secs: u64,
    pub monitor_poll_secs: u64,
    /// Long-poll wait per receive; 0 returns immediately.
    pub receive_wait_secs: u64,
    pub keep_alive: KeepAlivePolicy,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            default_lease_secs: DEFAULT_LEASE_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
            monitor_poll_secs: DEFAULT_MONITOR_POLL_SECS,
            receive_wait_secs: 0,
            keep_alive: KeepAlivePolicy::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl StrataConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StrataError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_lease_secs == 0 || self.default_lease_secs > MAX_LEASE_SECS {
            return Err(StrataError::Configuration(format!(
                "default_lease_secs must be in 1..={MAX_LEASE_SECS}, got {}",
                self.default_lease_secs
            )));
        }
        if !(MIN_RETENTION_SECS..=DEFAULT_RETENTION_SECS).contains(&self.retention_secs) {
            return Err(StrataError::Configuration(format!(
                "retention_secs must be in {MIN_RETENTION_SECS}..={DEFAULT_RETENTION_SECS}, got {}",
                self.retention_secs
            )));
        }
        if self.monitor_poll_secs == 0 {
            return Err(StrataError::Configuration(
                "monitor_poll_secs must be positive".into(),
            ));
        }
        self.keep_alive.validate()
    }

    pub fn default_lease(&self) -> Duration {
        Duration::from_secs(self.default_lease_secs)
    }

    pub fn monitor_poll_period(&self) -> Duration {
        Duration::from_secs(self.monitor_poll_secs)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs)
    }

    /// Attributes applied to every backing queue on creation.
    pub fn queue_attributes(&self) -> QueueAttributes {
        QueueAttributes {
            retention: Duration::from_secs(self.retention_secs),
            default_visibility: self.default_lease(),
        }
    }
}
