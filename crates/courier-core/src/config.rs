// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Courier configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Service name recorded on node rows and dead letters
    pub service_name: String,
    /// Durability tunables
    pub durability: DurabilitySettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `COURIER_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `COURIER_SERVICE_NAME`: service name (default: courier)
    /// - `COURIER_SCHEDULED_POLL_SECS`: scheduled job poll interval (default: 5)
    /// - `COURIER_RECOVERY_POLL_SECS`: recovery agent interval (default: 5)
    /// - `COURIER_RECOVERY_BATCH_SIZE`: rows claimed per recovery cycle (default: 100)
    /// - `COURIER_HEARTBEAT_SECS`: node heartbeat interval (default: 10)
    /// - `COURIER_STALE_NODE_SECS`: heartbeat age after which a node is dead (default: 30)
    /// - `COURIER_MAX_ATTEMPTS`: deliveries before dead-lettering (default: 3)
    /// - `COURIER_OUTBOX_BATCH_SIZE`: outgoing rows per write batch (default: 100)
    /// - `COURIER_KEEP_HANDLED_SECS`: handled envelope retention (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("COURIER_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("COURIER_DATABASE_URL"))?;

        let service_name =
            std::env::var("COURIER_SERVICE_NAME").unwrap_or_else(|_| "courier".to_string());
        if service_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "COURIER_SERVICE_NAME",
                "must not be empty",
            ));
        }

        let defaults = DurabilitySettings::default();
        let durability = DurabilitySettings {
            scheduled_poll_interval: secs_var("COURIER_SCHEDULED_POLL_SECS", 5)?,
            recovery_interval: secs_var("COURIER_RECOVERY_POLL_SECS", 5)?,
            recovery_batch_size: positive_var("COURIER_RECOVERY_BATCH_SIZE", 100)?,
            health_check_interval: secs_var("COURIER_HEARTBEAT_SECS", 10)?,
            stale_node_threshold: secs_var("COURIER_STALE_NODE_SECS", 30)?,
            max_attempts: positive_var("COURIER_MAX_ATTEMPTS", 3)?,
            outbox_batch_size: positive_var("COURIER_OUTBOX_BATCH_SIZE", 100)?,
            keep_handled_for: Duration::from_secs(parse_var(
                "COURIER_KEEP_HANDLED_SECS",
                300u64,
                "must be a non-negative number of seconds",
            )?),
            ..defaults
        };

        Ok(Self {
            database_url,
            service_name,
            durability,
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

fn secs_var(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_var(key, default, "must be a positive number of seconds")?;
    if secs == 0 {
        return Err(ConfigError::Invalid(
            key,
            "must be a positive number of seconds",
        ));
    }
    Ok(Duration::from_secs(secs))
}

fn positive_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let value = parse_var(key, default, "must be a positive integer")?;
    if value <= T::default() {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// How a node participates in cluster coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Nodes elect a leader through the store and share singleton agents.
    #[default]
    Balanced,
    /// Single node deployment; the node is always leader and runs every agent.
    Solo,
}

/// Durability tunables.
///
/// Staleness threshold and batch sizes trade recovery latency against
/// contention between nodes, so every one of them is configurable.
#[derive(Debug, Clone)]
pub struct DurabilitySettings {
    /// Coordination mode.
    pub mode: DurabilityMode,
    /// Heartbeat and control-queue drain interval.
    pub health_check_interval: Duration,
    /// Heartbeat age after which the leader evicts a node.
    pub stale_node_threshold: Duration,
    /// Lifetime of a leadership lease between renewals.
    pub leadership_lease: Duration,
    /// Recovery agent interval.
    pub recovery_interval: Duration,
    /// Maximum rows claimed per recovery cycle.
    pub recovery_batch_size: usize,
    /// Durable scheduled-job poll interval.
    pub scheduled_poll_interval: Duration,
    /// Maximum scheduled rows promoted per poll.
    pub scheduled_batch_size: usize,
    /// Maximum envelopes per outgoing write transaction.
    pub outbox_batch_size: usize,
    /// How long handled incoming rows are retained for de-duplication.
    /// Zero deletes them immediately.
    pub keep_handled_for: Duration,
    /// How long dead letters are retained. `None` keeps them forever.
    pub dead_letter_retention: Option<Duration>,
    /// Retention sweep interval.
    pub retention_interval: Duration,
    /// Deliveries before a failing envelope is dead-lettered.
    pub max_attempts: i32,
    /// Consecutive send failures that latch a sending agent.
    pub sender_failures_before_latch: u32,
    /// Ping interval while a sending agent is latched.
    pub sender_ping_interval: Duration,
    /// How long in-flight handlers may drain on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            mode: DurabilityMode::Balanced,
            health_check_interval: Duration::from_secs(10),
            stale_node_threshold: Duration::from_secs(30),
            leadership_lease: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(5),
            recovery_batch_size: 100,
            scheduled_poll_interval: Duration::from_secs(5),
            scheduled_batch_size: 100,
            outbox_batch_size: 100,
            keep_handled_for: Duration::from_secs(300),
            dead_letter_retention: None,
            retention_interval: Duration::from_secs(60),
            max_attempts: 3,
            sender_failures_before_latch: 3,
            sender_ping_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: &[&str] = &[
        "COURIER_SERVICE_NAME",
        "COURIER_SCHEDULED_POLL_SECS",
        "COURIER_RECOVERY_POLL_SECS",
        "COURIER_RECOVERY_BATCH_SIZE",
        "COURIER_HEARTBEAT_SECS",
        "COURIER_STALE_NODE_SECS",
        "COURIER_MAX_ATTEMPTS",
        "COURIER_OUTBOX_BATCH_SIZE",
        "COURIER_KEEP_HANDLED_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL_VARS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("COURIER_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.service_name, "courier");
        let d = &config.durability;
        assert_eq!(d.scheduled_poll_interval, Duration::from_secs(5));
        assert_eq!(d.recovery_interval, Duration::from_secs(5));
        assert_eq!(d.recovery_batch_size, 100);
        assert_eq!(d.health_check_interval, Duration::from_secs(10));
        assert_eq!(d.stale_node_threshold, Duration::from_secs(30));
        assert_eq!(d.max_attempts, 3);
        assert_eq!(d.outbox_batch_size, 100);
        assert_eq!(d.keep_handled_for, Duration::from_secs(300));
        assert_eq!(d.mode, DurabilityMode::Balanced);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("COURIER_DATABASE_URL", "sqlite:courier.db");
        guard.set("COURIER_SERVICE_NAME", "billing");
        guard.set("COURIER_SCHEDULED_POLL_SECS", "2");
        guard.set("COURIER_RECOVERY_POLL_SECS", "3");
        guard.set("COURIER_RECOVERY_BATCH_SIZE", "250");
        guard.set("COURIER_HEARTBEAT_SECS", "4");
        guard.set("COURIER_STALE_NODE_SECS", "12");
        guard.set("COURIER_MAX_ATTEMPTS", "5");
        guard.set("COURIER_OUTBOX_BATCH_SIZE", "50");
        guard.set("COURIER_KEEP_HANDLED_SECS", "0");

        let config = Config::from_env().unwrap();

        assert_eq!(config.service_name, "billing");
        let d = &config.durability;
        assert_eq!(d.scheduled_poll_interval, Duration::from_secs(2));
        assert_eq!(d.recovery_interval, Duration::from_secs(3));
        assert_eq!(d.recovery_batch_size, 250);
        assert_eq!(d.health_check_interval, Duration::from_secs(4));
        assert_eq!(d.stale_node_threshold, Duration::from_secs(12));
        assert_eq!(d.max_attempts, 5);
        assert_eq!(d.outbox_batch_size, 50);
        assert_eq!(d.keep_handled_for, Duration::ZERO);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("COURIER_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("COURIER_DATABASE_URL")));
        assert!(err.to_string().contains("COURIER_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_max_attempts() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("COURIER_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("COURIER_MAX_ATTEMPTS", "abc");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("COURIER_MAX_ATTEMPTS", _)));
    }

    #[test]
    fn test_config_rejects_zero_batch_and_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("COURIER_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("COURIER_RECOVERY_BATCH_SIZE", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("COURIER_RECOVERY_BATCH_SIZE", _)
        ));

        guard.set("COURIER_RECOVERY_BATCH_SIZE", "10");
        guard.set("COURIER_HEARTBEAT_SECS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("COURIER_HEARTBEAT_SECS", _)
        ));
    }

    #[test]
    fn test_config_negative_max_attempts() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("COURIER_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("COURIER_MAX_ATTEMPTS", "-2");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }

    #[test]
    fn test_default_staleness_is_three_heartbeats() {
        let settings = DurabilitySettings::default();
        assert_eq!(
            settings.stale_node_threshold,
            settings.health_check_interval * 3
        );
        assert!(settings.dead_letter_retention.is_none());
    }
}
