//! Sessions, login throttling and authentication for Trenova.
//!
//! - [`session`] and [`store`] - IP-bound sessions cached under
//!   `session:<id>`, with a short fallback session while the cache is down
//! - [`rate_limit`] - per (ip, user) login attempt counter
//! - [`service`] - login, refresh, logout and session management
//! - [`http`] and [`middleware`] - the axum surface

pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod password;
pub mod rate_limit;
pub mod service;
pub mod session;
pub mod store;
pub mod user;

pub use config::{AuthConfig, BootstrapUser, CookieConfig, LoginThrottleConfig, ProxyConfig};
pub use error::{AuthError, AuthResult, ErrorCategory};
pub use middleware::{AuthState, ClientIp, RequestContext, require_session};
pub use rate_limit::LoginRateLimiter;
pub use service::{AuthService, ClientInfo, LoginRequest, LoginResponse};
pub use session::{EventType, Session, SessionEvent, SessionStatus};
pub use store::SessionStore;
pub use user::{InMemoryUserRepository, User, UserRepository, UserStatus};
