//! Idle backoff between publish cycles
//!
//! A cycle that claims nothing multiplies the pause before the next one, up
//! to `max_interval`. A cycle that claims work resets it to `min_interval`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use docevents_engine::config::duration_millis;
use docevents_engine::ConfigError;

/// Pause bounds between retrievals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Pause after a cycle that claimed events
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest pause while the queue stays empty
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor per idle cycle, at least 1.0
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval > self.max_interval {
            return Err(ConfigError::Invalid {
                field: "poller.min_interval",
                reason: format!(
                    "{:?} exceeds max interval {:?}",
                    self.min_interval, self.max_interval
                ),
            });
        }
        Ok(())
    }
}

/// Current pause between retrievals
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    config: PollerConfig,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            current: config.min_interval,
            config,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a cycle's claim count and return the pause before the next one
    pub fn after_cycle(&mut self, claimed: usize) -> Duration {
        if claimed == 0 {
            self.grow();
        } else {
            self.current = self.config.min_interval;
        }
        self.current
    }

    /// Lengthen the pause after a failed cycle
    pub fn grow(&mut self) -> Duration {
        let next = self.current.mul_f64(self.config.backoff_multiplier);
        self.current = next.min(self.config.max_interval).max(self.config.min_interval);
        self.current
    }
}
