//! Engine configuration.
//!
//! Defaults suit tests and local use; every field can be overridden from
//! `EXERT_*` environment variables via [`EngineConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables shared by the dispatcher, lease manager, and worker pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum wait between exertion space checks, in milliseconds.
    pub poll_interval_ms: u64,
    /// Lease duration granted when none is requested, in milliseconds.
    pub default_lease_duration_ms: u64,
    /// Upper bound on any granted lease duration, in milliseconds.
    pub max_lease_duration_ms: u64,
    /// Silence after which a renewable lease times out, in milliseconds.
    pub lease_heartbeat_timeout_ms: Option<u64>,
    /// How often the lease sweeper runs, in milliseconds.
    pub lease_sweep_interval_ms: u64,
    /// Bound on a synchronous pull wait, in milliseconds.
    pub dispatch_timeout_ms: u64,
    /// Fraction of the lease duration after which the holder renews.
    pub renew_at_fraction: f64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Engine-wide cap on While iterations, when the exertion sets none.
    pub max_while_iterations: Option<u64>,
    /// How long the monitor keeps a finished exertion's status, in
    /// milliseconds.
    pub monitor_retention_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            default_lease_duration_ms: 30_000,
            max_lease_duration_ms: 300_000,
            lease_heartbeat_timeout_ms: None,
            lease_sweep_interval_ms: 2_000,
            dispatch_timeout_ms: 30_000,
            renew_at_fraction: 0.5,
            event_capacity: 1024,
            max_while_iterations: None,
            monitor_retention_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = read("EXERT_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_positive("EXERT_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = read("EXERT_DEFAULT_LEASE_MS") {
            config.default_lease_duration_ms = parse_positive("EXERT_DEFAULT_LEASE_MS", &v)?;
        }
        if let Some(v) = read("EXERT_MAX_LEASE_MS") {
            config.max_lease_duration_ms = parse_positive("EXERT_MAX_LEASE_MS", &v)?;
        }
        if let Some(v) = read("EXERT_LEASE_HEARTBEAT_MS") {
            config.lease_heartbeat_timeout_ms =
                Some(parse_positive("EXERT_LEASE_HEARTBEAT_MS", &v)?);
        }
        if let Some(v) = read("EXERT_LEASE_SWEEP_MS") {
            config.lease_sweep_interval_ms = parse_positive("EXERT_LEASE_SWEEP_MS", &v)?;
        }
        if let Some(v) = read("EXERT_DISPATCH_TIMEOUT_MS") {
            config.dispatch_timeout_ms = parse_positive("EXERT_DISPATCH_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = read("EXERT_RENEW_AT_FRACTION") {
            let fraction: f64 = v.trim().parse().map_err(|_| {
                invalid("EXERT_RENEW_AT_FRACTION", &v, "expected a number")
            })?;
            if !(fraction > 0.0 && fraction < 1.0) {
                return Err(invalid(
                    "EXERT_RENEW_AT_FRACTION",
                    &v,
                    "must be between 0 and 1",
                ));
            }
            config.renew_at_fraction = fraction;
        }
        if let Some(v) = read("EXERT_EVENT_CAPACITY") {
            config.event_capacity = parse_positive("EXERT_EVENT_CAPACITY", &v)? as usize;
        }
        if let Some(v) = read("EXERT_MAX_WHILE_ITERATIONS") {
            config.max_while_iterations =
                Some(parse_positive("EXERT_MAX_WHILE_ITERATIONS", &v)?);
        }
        if let Some(v) = read("EXERT_MONITOR_RETENTION_MS") {
            config.monitor_retention_ms = parse_positive("EXERT_MONITOR_RETENTION_MS", &v)?;
        }

        if config.default_lease_duration_ms > config.max_lease_duration_ms {
            return Err(invalid(
                "EXERT_DEFAULT_LEASE_MS",
                &config.default_lease_duration_ms.to_string(),
                "exceeds the maximum lease duration",
            ));
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_lease_duration(&self) -> Duration {
        Duration::from_millis(self.default_lease_duration_ms)
    }

    pub fn max_lease_duration(&self) -> Duration {
        Duration::from_millis(self.max_lease_duration_ms)
    }

    pub fn lease_heartbeat_timeout(&self) -> Option<Duration> {
        self.lease_heartbeat_timeout_ms.map(Duration::from_millis)
    }

    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lease_sweep_interval_ms)
    }

    pub fn monitor_retention(&self) -> Duration {
        Duration::from_millis(self.monitor_retention_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Delay after which a lease of `duration` should be renewed.
    pub fn renew_after(&self, duration: Duration) -> Duration {
        duration.mul_f64(self.renew_at_fraction)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(invalid(key, value, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(_) => Err(invalid(key, value, "expected a positive integer")),
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
