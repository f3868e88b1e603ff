//! Redis connection and circuit breaker settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis connection configuration.
///
/// # Example (TOML)
///
/// ```toml
/// [redis]
/// url = "redis://localhost:6379"
/// pool_size = 10
/// connect_timeout = "5s"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,

    /// Maximum number of pooled connections.
    pub pool_size: usize,

    /// Connections opened eagerly at startup.
    pub min_idle: usize,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Deadline for a query round-trip.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Deadline for a mutation round-trip.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            min_idle: 10,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
        }
    }
}

impl RedisConfig {
    /// Upper bound for a single command round-trip.
    pub fn command_timeout(&self) -> Duration {
        self.read_timeout.max(self.write_timeout)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within `window` that trip the breaker.
    pub failure_threshold: u32,

    /// Observation window for counting failures.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Time spent Open before a probe is allowed.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(10),
        }
    }
}
