//! Session cookie authentication for axum.
//!
//! [`require_session`] resolves the session cookie to a validated session
//! and stores a [`RequestContext`] in the request extensions. Handlers
//! behind it take `RequestContext` as an extractor.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::USER_AGENT, request::Parts},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use trenova_core::Pulid;

use crate::config::{CookieConfig, ProxyConfig};
use crate::error::AuthError;
use crate::service::{AuthService, ClientInfo};

/// Shared state for the auth routes and middleware.
#[derive(Clone)]
pub struct AuthState {
    pub service: Arc<AuthService>,
    pub cookie: CookieConfig,
    pub proxy: ProxyConfig,
}

impl AuthState {
    pub fn new(service: Arc<AuthService>, cookie: CookieConfig) -> Self {
        Self {
            service,
            cookie,
            proxy: ProxyConfig::default(),
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }
}

/// Identity of the authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub session_id: Pulid,
    pub user_id: Pulid,
    pub business_unit_id: Pulid,
    pub organization_id: Pulid,
    /// The cache was unreachable and the identifiers above are synthetic.
    pub fallback: bool,
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or(AuthError::MissingSession)
    }
}

/// Caller address. When `proxy` trusts the peer: first `X-Forwarded-For`
/// hop, then `X-Real-IP`. Otherwise, and as the last resort, the socket peer.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    proxy: &ProxyConfig,
) -> Option<String> {
    if !proxy.trusts(peer) {
        return peer.map(|addr| addr.ip().to_string());
    }

    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
        && !first.trim().is_empty()
    {
        return Some(first.trim().to_string());
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return Some(value.trim().to_string());
    }

    peer.map(|addr| addr.ip().to_string())
}

pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthState::from_ref(state);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let ip = client_ip(&parts.headers, peer, &auth.proxy);
        Ok(Self(ip.unwrap_or_else(|| "unknown".to_string())))
    }
}

/// [`ClientInfo`] from the caller's address and `User-Agent`.
pub struct Client(pub ClientInfo);

impl<S> FromRequestParts<S> for Client
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let ClientIp(ip) = ClientIp::from_request_parts(parts, state).await?;
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Ok(Self(ClientInfo::new(ip, user_agent)))
    }
}

/// Session id from the configured cookie. A malformed id reads as unknown.
pub fn session_id_from_cookie(jar: &CookieJar, config: &CookieConfig) -> Result<Pulid, AuthError> {
    let cookie = jar.get(&config.name).ok_or(AuthError::MissingSession)?;
    Pulid::parse(cookie.value()).map_err(|_| AuthError::SessionNotFound)
}

/// Rejects requests without a valid, IP-matched session.
pub async fn require_session(
    State(state): State<AuthState>,
    jar: CookieJar,
    ClientIp(ip): ClientIp,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let session_id = session_id_from_cookie(&jar, &state.cookie)?;
    let session = state.service.sessions().get_valid(&session_id, &ip).await?;

    req.extensions_mut().insert(RequestContext {
        session_id: session.id,
        user_id: session.user_id,
        business_unit_id: session.business_unit_id,
        organization_id: session.organization_id,
        fallback: session.fallback,
    });
    Ok(next.run(req).await)
}
