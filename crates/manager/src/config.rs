//! Node configuration
//!
//! The running timeout has no default: how long a task may hold its claim
//! before another node may reclaim it depends entirely on the workload, so
//! it must always be configured.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration of one task manager node
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tasklane_manager::ManagerConfig;
///
/// let config = ManagerConfig::new(Duration::from_secs(300))
///     .with_node_id("reports-1")
///     .with_max_workers(20)
///     .with_poll_interval(Duration::from_secs(1));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Owner id written on claimed tasks (generated if not provided)
    pub node_id: String,

    /// Pause between polling cycles
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Upper bound of the random delay added to each pause
    #[serde(with = "duration_millis")]
    pub poll_jitter: Duration,

    /// Worker pool capacity
    pub max_workers: usize,

    /// Runs allowed before a failing task is parked as failed
    pub max_attempts: u32,

    /// Lease of a claimed or running task
    #[serde(with = "duration_millis")]
    pub running_timeout: Duration,

    /// Pending run-now requests
    pub run_request_buffer: usize,

    /// How long shutdown waits for running tasks
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Publish load and polling delay stats
    pub stats_enabled: bool,
}

impl ManagerConfig {
    /// Create a configuration with the given running timeout
    pub fn new(running_timeout: Duration) -> Self {
        Self {
            node_id: format!("node-{}", Uuid::now_v7()),
            poll_interval: Duration::from_secs(3),
            poll_jitter: Duration::from_millis(500),
            max_workers: 10,
            max_attempts: 3,
            running_timeout,
            run_request_buffer: 64,
            shutdown_timeout: Duration::from_secs(30),
            stats_enabled: true,
        }
    }

    /// Set the node id
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the poll jitter bound
    pub fn with_poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Set the worker pool capacity
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the default attempt limit
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the run request buffer size
    pub fn with_run_request_buffer(mut self, size: usize) -> Self {
        self.run_request_buffer = size;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable or disable stats
    pub fn with_stats_enabled(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.running_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "running_timeout must be positive".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.run_request_buffer == 0 {
            return Err(ConfigError::Invalid(
                "run_request_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Create configuration from `TASKLANE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let running_timeout = parse::<u64>(&lookup, "TASKLANE_RUNNING_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .ok_or(ConfigError::Missing("TASKLANE_RUNNING_TIMEOUT_MS"))?;

        let mut config = Self::new(running_timeout);

        if let Some(node_id) = lookup("TASKLANE_NODE_ID").filter(|s| !s.trim().is_empty()) {
            config.node_id = node_id;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TASKLANE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "TASKLANE_POLL_JITTER_MS")? {
            config.poll_jitter = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "TASKLANE_MAX_WORKERS")? {
            config.max_workers = n;
        }
        if let Some(n) = parse(&lookup, "TASKLANE_MAX_ATTEMPTS")? {
            config.max_attempts = n;
        }
        if let Some(n) = parse(&lookup, "TASKLANE_RUN_REQUEST_BUFFER")? {
            config.run_request_buffer = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TASKLANE_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse(&lookup, "TASKLANE_STATS_ENABLED")? {
            config.stats_enabled = enabled;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Parse {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Parse {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

mod duration_millis {
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
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_new_config_is_valid() {
        let config = ManagerConfig::new(Duration::from_secs(60));
        assert!(config.node_id.starts_with("node-"));
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let base = ManagerConfig::new(Duration::from_secs(60));
        assert!(base.clone().with_max_workers(0).validate().is_err());
        assert!(base.clone().with_max_attempts(0).validate().is_err());
        assert!(base.clone().with_poll_interval(Duration::ZERO).validate().is_err());
        assert!(base.clone().with_run_request_buffer(0).validate().is_err());
        assert!(ManagerConfig::new(Duration::ZERO).validate().is_err());
        assert!(base.with_node_id(" ").validate().is_err());
    }

    #[test]
    fn test_from_lookup_requires_running_timeout() {
        let err = ManagerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("TASKLANE_RUNNING_TIMEOUT_MS"));
    }

    #[test]
    fn test_from_lookup_reads_every_setting() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("TASKLANE_RUNNING_TIMEOUT_MS", "120000"),
            ("TASKLANE_NODE_ID", "reports-1"),
            ("TASKLANE_POLL_INTERVAL_MS", "250"),
            ("TASKLANE_POLL_JITTER_MS", "0"),
            ("TASKLANE_MAX_WORKERS", "4"),
            ("TASKLANE_MAX_ATTEMPTS", "7"),
            ("TASKLANE_RUN_REQUEST_BUFFER", "2"),
            ("TASKLANE_SHUTDOWN_TIMEOUT_MS", "1000"),
            ("TASKLANE_STATS_ENABLED", "false"),
        ]))
        .unwrap();

        assert_eq!(config.running_timeout, Duration::from_secs(120));
        assert_eq!(config.node_id, "reports-1");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.poll_jitter, Duration::ZERO);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.run_request_buffer, 2);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert!(!config.stats_enabled);
    }

    #[test]
    fn test_from_lookup_reports_bad_values() {
        let err = ManagerConfig::from_lookup(lookup(&[
            ("TASKLANE_RUNNING_TIMEOUT_MS", "60000"),
            ("TASKLANE_MAX_WORKERS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Parse {
                name: "TASKLANE_MAX_WORKERS",
                ..
            }
        ));
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let config = ManagerConfig::new(Duration::from_secs(90)).with_node_id("n1");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["running_timeout"], 90_000);
        assert_eq!(json["poll_interval"], 3_000);

        let back: ManagerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
