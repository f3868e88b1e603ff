use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trenova_auth::AuthConfig;
use trenova_cache::{BreakerConfig, RedisConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.server.port == 0 {
            return invalid("server.port must be > 0");
        }
        if self.server.host.parse::<IpAddr>().is_err() {
            return invalid("server.host must be an IP address");
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return invalid("logging.level must be one of trace, debug, info, warn, error");
        }
        if let Some(bad) = self
            .logging
            .directives
            .iter()
            .find(|d| d.parse::<tracing_subscriber::filter::Directive>().is_err())
        {
            return Err(ConfigError::Invalid(format!(
                "logging.directives entry {bad:?} is not a valid filter directive"
            )));
        }
        if self.redis.pool_size == 0 {
            return invalid("redis.pool_size must be > 0");
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be > 0");
        }
        if self.auth.login.max_attempts == 0 {
            return invalid("auth.login.max_attempts must be > 0");
        }
        if self.auth.fallback_session_ttl > self.auth.session_storage_ttl {
            return invalid("auth.fallback_session_ttl must not exceed auth.session_storage_ttl");
        }
        if self.websocket.send_buffer == 0 || self.websocket.broadcast_buffer == 0 {
            return invalid("websocket buffers must be > 0");
        }
        if self.websocket.ping_interval.is_zero() {
            return invalid("websocket.ping_interval must be > 0");
        }
        if self.websocket.resubscribe_initial > self.websocket.resubscribe_max {
            return invalid("websocket.resubscribe_initial must not exceed resubscribe_max");
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip = self
            .server
            .host
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            body_limit_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for every target.
    pub level: String,

    /// Per-target overrides such as `tower_http=debug`.
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directives: Vec::new(),
        }
    }
}

/// WebSocket bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Outbound frames buffered per connection before it counts as slow.
    pub send_buffer: usize,
    /// Capacity of the queue between the pub/sub reader and the hub.
    pub broadcast_buffer: usize,
    /// Protocol-level Ping cadence on every connection.
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub resubscribe_initial: Duration,
    #[serde(with = "humantime_serde")]
    pub resubscribe_max: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            send_buffer: 256,
            broadcast_buffer: 1000,
            ping_interval: Duration::from_secs(30),
            resubscribe_initial: Duration::from_secs(1),
            resubscribe_max: Duration::from_secs(300),
        }
    }
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_PATH: &str = "trenova.toml";

    /// File (if present) under `TRENOVA__*` environment overrides,
    /// e.g. `TRENOVA__REDIS__URL`.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let path = PathBuf::from(path.unwrap_or(DEFAULT_PATH));
        let mut builder = Config::builder();
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("TRENOVA")
                .try_parsing(true)
                .separator("__"),
        );
        let merged: AppConfig = builder.build()?.try_deserialize()?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.addr().port(), 8080);
        assert_eq!(cfg.websocket.send_buffer, 256);
        assert_eq!(cfg.websocket.resubscribe_max, Duration::from_secs(300));
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.logging.directives = vec![
            "tower_http=debug".to_string(),
            "tower_http=loudest".to_string(),
        ];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("logging.directives"));

        let mut cfg = AppConfig::default();
        cfg.websocket.send_buffer = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.auth.fallback_session_ttl = Duration::from_secs(73 * 3600);
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.breaker.failure_threshold = 0;
        assert!(cfg.validate().is_err());
    }
}
