//! Authentication configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session, login throttling and cookie settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Application-level lifetime written into `expiresAt` at login.
    #[serde(with = "humantime_serde")]
    pub session_lifetime: Duration,

    /// TTL of the cached session document, refreshed on every write.
    #[serde(with = "humantime_serde")]
    pub session_storage_ttl: Duration,

    /// Lifetime of a fallback session issued while the cache is unavailable.
    #[serde(with = "humantime_serde")]
    pub fallback_session_ttl: Duration,

    pub login: LoginThrottleConfig,

    pub cookie: CookieConfig,

    pub proxy: ProxyConfig,

    /// Users seeded into the in-memory repository at startup.
    pub bootstrap_users: Vec<BootstrapUser>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_lifetime: Duration::from_secs(30 * 24 * 60 * 60),
            session_storage_ttl: Duration::from_secs(72 * 60 * 60),
            fallback_session_ttl: Duration::from_secs(300),
            login: LoginThrottleConfig::default(),
            cookie: CookieConfig::default(),
            proxy: ProxyConfig::default(),
            bootstrap_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginThrottleConfig {
    /// Attempts allowed per (ip, user) inside one window.
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for LoginThrottleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    pub name: String,

    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    pub secure: bool,

    pub http_only: bool,

    pub same_site: SameSite,

    pub path: String,

    pub domain: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "trenova-session-id".to_string(),
            max_age: Duration::from_secs(3 * 24 * 60 * 60),
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
            path: "/".to_string(),
            domain: None,
        }
    }
}

/// Client address resolution behind a reverse proxy.
///
/// With `trust_headers` off the socket peer is always the client and
/// `X-Forwarded-For` / `X-Real-IP` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub trust_headers: bool,

    /// Peers allowed to set the forwarding headers. Empty accepts any peer.
    pub trusted_proxies: Vec<IpAddr>,
}

impl ProxyConfig {
    /// Whether forwarding headers sent by `peer` are believed.
    pub fn trusts(&self, peer: Option<SocketAddr>) -> bool {
        if !self.trust_headers {
            return false;
        }
        if self.trusted_proxies.is_empty() {
            return true;
        }
        peer.is_some_and(|addr| self.trusted_proxies.contains(&addr.ip()))
    }
}

/// A user defined in configuration.
///
/// Identifiers are generated when omitted. `organizations` lists extra
/// organizations the user may switch into besides the primary one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapUser {
    pub email_address: String,
    pub password: String,
    pub name: String,
    pub username: String,
    pub user_id: Option<String>,
    pub business_unit_id: Option<String>,
    pub organization_id: Option<String>,
    pub organizations: Vec<String>,
    pub active: bool,
    pub locked: bool,
}

impl Default for BootstrapUser {
    fn default() -> Self {
        Self {
            email_address: String::new(),
            password: String::new(),
            name: String::new(),
            username: String::new(),
            user_id: None,
            business_unit_id: None,
            organization_id: None,
            organizations: Vec::new(),
            active: true,
            locked: false,
        }
    }
}
