use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The key (or hash field) does not exist. Callers branch on this.
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("circuit breaker is open")]
    BreakerOpen,

    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("cache command failed: {0}")]
    Command(String),

    #[error("script not loaded on server: {0}")]
    NoScript(String),

    #[error("unknown script: {0}")]
    UnknownScript(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen)
    }

    /// Outage-class failures: the cache tier is unreachable or refusing work.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::BreakerOpen
        )
    }

    /// Whether this failure should count against the circuit breaker.
    pub(crate) fn trips_breaker(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::NoScriptError {
            return Self::NoScript(err.to_string());
        }
        if err.is_timeout() {
            return Self::timeout(err.to_string());
        }
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            return Self::Connection(err.to_string());
        }
        Self::Command(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        match err {
            deadpool_redis::PoolError::Timeout(_) => Self::timeout("pool checkout"),
            other => Self::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_classify_variants() {
        assert!(CacheError::not_found("k").is_not_found());
        assert!(!CacheError::not_found("k").is_transient());
        assert!(CacheError::BreakerOpen.is_breaker_open());
        assert!(CacheError::BreakerOpen.is_transient());
        assert!(CacheError::Connection("refused".into()).is_transient());
        assert!(CacheError::timeout("GET").is_transient());
        assert!(!CacheError::Command("WRONGTYPE".into()).is_transient());
    }

    #[test]
    fn only_io_failures_trip_the_breaker() {
        assert!(CacheError::Connection("x".into()).trips_breaker());
        assert!(CacheError::timeout("x").trips_breaker());
        assert!(!CacheError::BreakerOpen.trips_breaker());
        assert!(!CacheError::not_found("k").trips_breaker());
        assert!(!CacheError::Command("x".into()).trips_breaker());
    }

    #[test]
    fn redis_noscript_maps_to_noscript() {
        let err = redis::RedisError::from((
            redis::ErrorKind::NoScriptError,
            "NOSCRIPT No matching script",
        ));
        assert!(matches!(CacheError::from(err), CacheError::NoScript(_)));
    }

    #[test]
    fn redis_io_error_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = redis::RedisError::from(io);
        assert!(CacheError::from(err).is_transient());
    }
}
