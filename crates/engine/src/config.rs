//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for a [`crate::Backend`].
///
/// Every field has a default, so an empty TOML document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name this engine is discovered under; never visited as a plugin.
    pub name: String,
    /// How often the dependency gate polls discovery.
    pub poll_interval_ms: u64,
    /// Bound of every operation queue channel.
    pub queue_capacity: usize,
    /// Bound on queued adapter calls. Unbounded when absent.
    pub run_timeout_ms: Option<u64>,
    /// Bound on the dependency wait of a reconciliation pass. Unbounded when absent.
    pub dependency_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "steward".to_string(),
            poll_interval_ms: 5000,
            queue_capacity: 64,
            run_timeout_ms: None,
            dependency_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Short intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            poll_interval_ms: 10,
            queue_capacity: 16,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns a core TOML error for malformed input and `InvalidConfig`
    /// for values that fail validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = steward_core::document::parse_toml(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// As [`EngineConfig::from_toml_str`], plus read failures.
    pub async fn load(path: &Path) -> Result<Self> {
        let config: Self = steward_core::document::read_toml(path).await?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout_ms = timeout.map(duration_ms);
        self
    }

    #[must_use]
    pub fn with_dependency_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dependency_timeout_ms = timeout.map(duration_ms);
        self
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty name or a zero interval,
    /// capacity or timeout.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("name must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::invalid_config("poll_interval_ms must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::invalid_config("queue_capacity must be positive"));
        }
        if self.run_timeout_ms == Some(0) || self.dependency_timeout_ms == Some(0) {
            return Err(Error::invalid_config("timeouts must be positive when set"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn dependency_timeout(&self) -> Option<Duration> {
        self.dependency_timeout_ms.map(Duration::from_millis)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
