//! Repository and lease configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Lease timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaseConfig {
    /// How long a lease stays valid without renewal
    #[serde(with = "duration_millis")]
    pub ttl: Duration,

    /// How often the holder renews the lease
    #[serde(with = "duration_millis")]
    pub ping_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(30))
    }
}

impl LeaseConfig {
    /// Lease configuration pinging five times per TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ping_interval: ttl / 5,
        }
    }

    /// Set ping interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "lease.ping_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ping_interval >= self.ttl {
            return Err(ConfigError::Invalid {
                field: "lease.ping_interval",
                reason: format!(
                    "{:?} must be shorter than the lease TTL {:?}",
                    self.ping_interval, self.ttl
                ),
            });
        }
        Ok(())
    }
}

/// Configuration for [`DocumentEventRepository`](crate::DocumentEventRepository)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryConfig {
    /// Maximum records fetched per retrieval
    pub batch_size: usize,

    /// Age after which a `processing` record is considered abandoned
    #[serde(with = "duration_millis")]
    pub processing_timeout: Duration,

    /// Safety margin before the processing timeout at which a worker stops
    /// treating an event as its own
    #[serde(with = "duration_millis")]
    pub expire_threshold: Duration,

    /// Lease timing
    pub lease: LeaseConfig,

    /// Default identity cap for [`retrieve`](crate::DocumentEventRepository::retrieve)
    pub max_events_per_retrieval: usize,

    /// Upper bound on the batched persistence write
    #[serde(with = "duration_millis")]
    pub write_timeout: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            processing_timeout: Duration::from_secs(300),
            expire_threshold: Duration::from_secs(30),
            lease: LeaseConfig::default(),
            max_events_per_retrieval: 10,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl RepositoryConfig {
    /// Create a new repository configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set fetch batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set processing timeout
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    /// Set expire threshold
    pub fn with_expire_threshold(mut self, threshold: Duration) -> Self {
        self.expire_threshold = threshold;
        self
    }

    /// Set lease timing
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    /// Set default identity cap per retrieval
    pub fn with_max_events_per_retrieval(mut self, max: usize) -> Self {
        self.max_events_per_retrieval = max;
        self
    }

    /// Set persistence write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.expire_threshold >= self.processing_timeout {
            return Err(ConfigError::Invalid {
                field: "expire_threshold",
                reason: format!(
                    "{:?} must be shorter than the processing timeout {:?}",
                    self.expire_threshold, self.processing_timeout
                ),
            });
        }
        self.lease.validate()
    }

    /// Load configuration from `DOCEVENTS_*` environment variables
    ///
    /// Unset variables keep their defaults. The lease ping interval defaults
    /// to a fifth of the configured TTL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let millis = |var: &str| -> Result<Option<Duration>, ConfigError> {
            parse_var::<u64>(&lookup, var).map(|ms| ms.map(Duration::from_millis))
        };

        let ttl = millis("DOCEVENTS_LEASE_TTL_MS")?.unwrap_or(defaults.lease.ttl);
        let mut lease = LeaseConfig::with_ttl(ttl);
        if let Some(interval) = millis("DOCEVENTS_LEASE_PING_INTERVAL_MS")? {
            lease = lease.with_ping_interval(interval);
        }

        let config = Self {
            batch_size: parse_var(&lookup, "DOCEVENTS_BATCH_SIZE")?
                .unwrap_or(defaults.batch_size),
            processing_timeout: millis("DOCEVENTS_PROCESSING_TIMEOUT_MS")?
                .unwrap_or(defaults.processing_timeout),
            expire_threshold: millis("DOCEVENTS_EXPIRE_THRESHOLD_MS")?
                .unwrap_or(defaults.expire_threshold),
            lease,
            max_events_per_retrieval: parse_var(&lookup, "DOCEVENTS_MAX_EVENTS_PER_RETRIEVAL")?
                .unwrap_or(defaults.max_events_per_retrieval),
            write_timeout: millis("DOCEVENTS_WRITE_TIMEOUT_MS")?.unwrap_or(defaults.write_timeout),
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse {
                var: var.to_string(),
                value,
            }),
    }
}

/// Serde support for Duration as milliseconds
///
/// Usable with `#[serde(with = "docevents_engine::config::duration_millis")]`.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RepositoryConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.processing_timeout, Duration::from_secs(300));
        assert_eq!(config.expire_threshold, Duration::from_secs(30));
        assert_eq!(config.lease.ttl, Duration::from_secs(30));
        assert_eq!(config.lease.ping_interval, Duration::from_secs(6));
        assert_eq!(config.max_events_per_retrieval, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RepositoryConfig::new()
            .with_batch_size(5)
            .with_processing_timeout(Duration::from_secs(60))
            .with_expire_threshold(Duration::from_secs(5))
            .with_lease(LeaseConfig::with_ttl(Duration::from_millis(500)))
            .with_max_events_per_retrieval(3);

        assert_eq!(config.batch_size, 5);
        assert_eq!(config.lease.ping_interval, Duration::from_millis(100));
        assert_eq!(config.max_events_per_retrieval, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inconsistent_values() {
        let zero_batch = RepositoryConfig::new().with_batch_size(0);
        assert!(matches!(
            zero_batch.validate(),
            Err(ConfigError::Invalid { field: "batch_size", .. })
        ));

        let threshold = RepositoryConfig::new()
            .with_processing_timeout(Duration::from_secs(10))
            .with_expire_threshold(Duration::from_secs(10));
        assert!(threshold.validate().is_err());

        let slow_ping = RepositoryConfig::new().with_lease(
            LeaseConfig::with_ttl(Duration::from_secs(1))
                .with_ping_interval(Duration::from_secs(1)),
        );
        assert!(slow_ping.validate().is_err());
    }

    #[test]
    fn test_from_env_overrides_defaults() {
        let config = RepositoryConfig::from_lookup(lookup(&[
            ("DOCEVENTS_BATCH_SIZE", "20"),
            ("DOCEVENTS_LEASE_TTL_MS", "1000"),
            ("DOCEVENTS_MAX_EVENTS_PER_RETRIEVAL", "4"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 20);
        assert_eq!(config.lease.ttl, Duration::from_secs(1));
        assert_eq!(config.lease.ping_interval, Duration::from_millis(200));
        assert_eq!(config.max_events_per_retrieval, 4);
        assert_eq!(config.processing_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        let err = RepositoryConfig::from_lookup(lookup(&[("DOCEVENTS_BATCH_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref var, .. } if var == "DOCEVENTS_BATCH_SIZE"));
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let json = serde_json::to_value(RepositoryConfig::default()).unwrap();
        assert_eq!(json["processing_timeout"], 300_000);
        assert_eq!(json["lease"]["ping_interval"], 6_000);
    }
}
