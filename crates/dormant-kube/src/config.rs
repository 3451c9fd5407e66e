//! Hibernation configuration
//!
//! Stored in `~/.config/dormant/config.yaml`. Every field is optional; missing
//! fields take the defaults below. Loaded values are validated, so a zero
//! polling interval or a shrinking backoff is reported instead of acted upon.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HibernateError, Result};
use crate::retry::RetryConfig;

/// Timeouts and polling bounds for the hibernation protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HibernationConfig {
    /// Overall bound for confirming that swept objects are gone
    #[serde(with = "humantime_serde")]
    pub teardown_timeout: Duration,

    /// Bound for a resumed cluster to report ready
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,

    /// Bound for instances to stop once the cluster is fenced
    #[serde(with = "humantime_serde")]
    pub fence_timeout: Duration,

    /// First polling interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Polling interval ceiling
    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,

    /// Backoff for transient object-store failures
    pub retry: RetryConfig,
}

impl Default for HibernationConfig {
    fn default() -> Self {
        Self {
            teardown_timeout: Duration::from_secs(180),
            readiness_timeout: Duration::from_secs(600),
            fence_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            max_poll_interval: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl HibernationConfig {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HibernateError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| HibernateError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate().map_err(|e| match e {
            HibernateError::InvalidConfig(reason) => {
                HibernateError::InvalidConfig(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })?;
        Ok(config)
    }

    /// Check that every bound is usable
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("teardownTimeout", self.teardown_timeout),
            ("readinessTimeout", self.readiness_timeout),
            ("fenceTimeout", self.fence_timeout),
            ("pollInterval", self.poll_interval),
        ];
        for (field, value) in timeouts {
            if value.is_zero() {
                return Err(HibernateError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    field
                )));
            }
        }
        if self.max_poll_interval < self.poll_interval {
            return Err(HibernateError::InvalidConfig(format!(
                "maxPollInterval ({:?}) is shorter than pollInterval ({:?})",
                self.max_poll_interval, self.poll_interval
            )));
        }
        self.retry.validate()
    }

    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dormant").join("config.yaml"))
    }
}
