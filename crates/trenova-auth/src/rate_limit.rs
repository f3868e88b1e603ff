//! Login attempt throttling.
//!
//! One counter per (ip, user) under `login_attempts:<ip>:<user_id>`. Each
//! check increments first and then compares, so with the default limit of
//! five the sixth attempt inside the window is the first one denied.

use std::sync::Arc;
use std::time::Duration;

use trenova_cache::CacheStore;
use trenova_core::Pulid;

use crate::config::LoginThrottleConfig;
use crate::error::{AuthError, AuthResult};

pub fn attempts_key(ip: &str, user_id: &Pulid) -> String {
    format!("login_attempts:{ip}:{user_id}")
}

#[derive(Clone)]
pub struct LoginRateLimiter {
    cache: Arc<dyn CacheStore>,
    max_attempts: u32,
    window: Duration,
}

impl LoginRateLimiter {
    pub fn new(cache: Arc<dyn CacheStore>, config: &LoginThrottleConfig) -> Self {
        Self {
            cache,
            max_attempts: config.max_attempts,
            window: config.window,
        }
    }

    /// Record an attempt and deny once the limit is exceeded.
    ///
    /// Fails open: if the cache is unreachable the attempt is allowed.
    pub async fn check(&self, ip: &str, user_id: &Pulid) -> AuthResult<()> {
        let key = attempts_key(ip, user_id);
        match self.cache.increase_with_expiry(&key, self.window).await {
            Ok(count) if count > i64::from(self.max_attempts) => {
                tracing::info!(client_ip = %ip, user_id = %user_id, attempts = count, "login rate limit exceeded");
                Err(AuthError::RateLimited)
            }
            Ok(_) => Ok(()),
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    client_ip = %ip,
                    user_id = %user_id,
                    error = %err,
                    "rate limiter unavailable, allowing login attempt"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Clear the counter after a successful login.
    pub async fn reset(&self, ip: &str, user_id: &Pulid) -> AuthResult<()> {
        self.cache.del(&[attempts_key(ip, user_id)]).await?;
        Ok(())
    }
}
