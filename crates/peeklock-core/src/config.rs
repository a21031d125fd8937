//! Configuration structures.
//!
//! Durations are written in humantime form (`"8s"`, `"500ms"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::lease_guard::DEFAULT_RENEW_INTERVAL;
use crate::domain::{ConsumerError, Result};

/// Consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum number of messages processed concurrently.
    pub capacity: usize,

    /// Halt all future pulls after the first handler failure.
    pub stop_on_failure: bool,

    /// Keep each in-flight message's lock alive while its handler runs.
    pub auto_renew: bool,

    /// How often a held lock is renewed.
    #[serde(with = "humantime_serde")]
    pub renew_interval: Duration,

    /// Pause before returning a slot after a fetch that came back empty.
    #[serde(with = "humantime_serde")]
    pub idle_backoff: Duration,

    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            stop_on_failure: false,
            auto_renew: true,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            idle_backoff: Duration::from_secs(1),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConsumerError::invalid_argument(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ConsumerError::invalid_argument(
                "capacity must be greater than zero",
            ));
        }
        if self.auto_renew && self.renew_interval.is_zero() {
            return Err(ConsumerError::invalid_argument(
                "renew_interval must be non-zero when auto_renew is on",
            ));
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
