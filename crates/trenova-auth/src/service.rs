//! Login, session refresh and logout.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use trenova_cache::CacheStore;
use trenova_core::{Pulid, now_unix};

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::password::{hash_password, verify_password};
use crate::rate_limit::LoginRateLimiter;
use crate::session::{EventType, Session, SessionEvent};
use crate::store::SessionStore;
use crate::user::{User, UserRepository};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub email_address: String,
    #[serde(default)]
    pub password: String,
}

impl LoginRequest {
    pub fn validate(&self) -> AuthResult<()> {
        validate_email(&self.email_address)?;
        if self.password.is_empty() {
            return Err(AuthError::validation("password", "Password is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: User,
    pub session_id: Pulid,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckEmailRequest {
    #[serde(default)]
    pub email_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckEmailResponse {
    pub valid: bool,
    pub message: String,
}

fn validate_email(email: &str) -> AuthResult<()> {
    let email = email.trim();
    if email.is_empty() {
        return Err(AuthError::validation("emailAddress", "Email address is required"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(AuthError::validation(
            "emailAddress",
            "Email address must be a valid email address",
        )),
    }
}

/// Client identity attached to every session-mutating call.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
        }
    }
}

pub struct AuthService {
    users: Arc<dyn UserRepository>,
    sessions: SessionStore,
    limiter: LoginRateLimiter,
    session_lifetime: Duration,
}

impl AuthService {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        users: Arc<dyn UserRepository>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            users,
            sessions: SessionStore::new(cache.clone(), config),
            limiter: LoginRateLimiter::new(cache, &config.login),
            session_lifetime: config.session_lifetime,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn users(&self) -> &Arc<dyn UserRepository> {
        &self.users
    }

    pub async fn login(&self, client: &ClientInfo, req: &LoginRequest) -> AuthResult<LoginResponse> {
        req.validate()?;

        let Some(mut user) = self.users.find_by_email(&req.email_address).await? else {
            // Unknown emails pay the same argon2 cost as wrong passwords.
            let password = req.password.clone();
            let _ = tokio::task::spawn_blocking(move || {
                verify_password(&password, unknown_user_hash())
            })
            .await;
            return Err(AuthError::InvalidCredentials);
        };

        self.limiter.check(&client.ip, &user.id).await?;

        // Argon2 verification is CPU bound.
        let candidate = user.clone();
        let password = req.password.clone();
        tokio::task::spawn_blocking(move || candidate.verify_credentials(&password))
            .await
            .map_err(|e| AuthError::internal(format!("credential check panicked: {e}")))??;

        let mut session = Session::new(
            user.id.clone(),
            user.business_unit_id.clone(),
            user.current_organization_id.clone(),
            &client.ip,
            &client.user_agent,
            self.session_lifetime,
        );
        session.add_event(SessionEvent::new(
            EventType::Login,
            &client.ip,
            &client.user_agent,
        ));
        self.sessions.create(&session).await?;

        let now = now_unix();
        if let Err(err) = self.users.update_last_login(&user.id, now).await {
            tracing::warn!(user_id = %user.id, error = %err, "failed to record last login");
        } else {
            user.last_login_at = Some(now);
        }
        if let Err(err) = self.limiter.reset(&client.ip, &user.id).await {
            tracing::warn!(user_id = %user.id, client_ip = %client.ip, error = %err, "failed to reset login attempts");
        }

        tracing::info!(user_id = %user.id, session_id = %session.id, client_ip = %client.ip, "user logged in");
        Ok(LoginResponse {
            user,
            session_id: session.id,
            expires_at: session.expires_at,
        })
    }

    pub async fn refresh(&self, session_id: &Pulid, client: &ClientInfo) -> AuthResult<Session> {
        self.sessions.get_valid(session_id, &client.ip).await?;
        self.sessions
            .update_activity(
                session_id,
                &client.ip,
                &client.user_agent,
                EventType::Accessed,
            )
            .await
    }

    /// Revoke the caller's own session. Requires an IP-matched session.
    pub async fn logout(&self, session_id: &Pulid, client: &ClientInfo) -> AuthResult<()> {
        self.sessions.get_valid(session_id, &client.ip).await?;
        self.sessions
            .revoke(session_id, &client.ip, &client.user_agent, "user logged out")
            .await?;
        Ok(())
    }

    pub async fn check_email(&self, req: &CheckEmailRequest) -> AuthResult<CheckEmailResponse> {
        validate_email(&req.email_address)?;
        let Some(user) = self.users.find_by_email(&req.email_address).await? else {
            return Ok(CheckEmailResponse {
                valid: false,
                message: "We couldn't find an account with that email address".to_string(),
            });
        };
        Ok(match user.ensure_can_login() {
            Ok(()) => CheckEmailResponse {
                valid: true,
                message: "Email address is valid".to_string(),
            },
            Err(AuthError::AccountUnavailable { message }) => CheckEmailResponse {
                valid: false,
                message,
            },
            Err(err) => return Err(err),
        })
    }

    /// Move the session to another of the user's organizations.
    pub async fn switch_organization(
        &self,
        session_id: &Pulid,
        client: &ClientInfo,
        organization_id: Pulid,
    ) -> AuthResult<Session> {
        let session = self.sessions.get_valid(session_id, &client.ip).await?;
        if session.fallback {
            return Err(trenova_cache::CacheError::BreakerOpen.into());
        }

        let user = self
            .users
            .find_by_id(&session.user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if !user.belongs_to(&organization_id) {
            return Err(AuthError::forbidden(
                "You do not have access to this organization",
            ));
        }

        let previous = session.organization_id.clone();
        self.sessions
            .update_organization(session_id, organization_id.clone())
            .await?;
        let session = self
            .sessions
            .append_event(
                session_id,
                SessionEvent::new(EventType::OrgSwitched, &client.ip, &client.user_agent)
                    .with_metadata(json!({ "from": previous, "to": organization_id })),
            )
            .await?;

        tracing::info!(
            session_id = %session_id,
            user_id = %session.user_id,
            org_id = %session.organization_id,
            "organization switched"
        );
        Ok(session)
    }

    pub async fn list_sessions(&self, session_id: &Pulid, client: &ClientInfo) -> AuthResult<Vec<Session>> {
        let session = self.sessions.get_valid(session_id, &client.ip).await?;
        if session.fallback {
            return Err(trenova_cache::CacheError::BreakerOpen.into());
        }
        self.sessions.active_by_user(&session.user_id).await
    }

    /// Log out everywhere. Returns the number of revoked sessions.
    pub async fn revoke_all_sessions(&self, session_id: &Pulid, client: &ClientInfo) -> AuthResult<usize> {
        let session = self.sessions.get_valid(session_id, &client.ip).await?;
        if session.fallback {
            return Err(trenova_cache::CacheError::BreakerOpen.into());
        }
        self.sessions
            .revoke_all_by_user(&session.user_id, "user revoked all sessions")
            .await
    }
}

/// Stand-in hash verified when no user matches the email.
fn unknown_user_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password("trenova-unknown-user").unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BootstrapUser, LoginThrottleConfig};
    use crate::error::ErrorCategory;
    use crate::session::SessionStatus;
    use crate::user::InMemoryUserRepository;
    use trenova_cache::InMemoryCache;
    use trenova_core::id;

    const EMAIL: &str = "e@x.io";
    const PASSWORD: &str = "hunter2";

    fn service_with(config: AuthConfig, extra_org: Option<&Pulid>) -> AuthService {
        let users = InMemoryUserRepository::from_bootstrap(&[BootstrapUser {
            email_address: EMAIL.to_string(),
            password: PASSWORD.to_string(),
            name: "E".to_string(),
            username: "e".to_string(),
            organizations: extra_org.map(|o| vec![o.to_string()]).unwrap_or_default(),
            ..BootstrapUser::default()
        }])
        .unwrap();
        AuthService::new(Arc::new(InMemoryCache::new()), Arc::new(users), &config)
    }

    fn service() -> AuthService {
        service_with(AuthConfig::default(), None)
    }

    fn login_req(password: &str) -> LoginRequest {
        LoginRequest {
            email_address: EMAIL.to_string(),
            password: password.to_string(),
        }
    }

    fn client(ip: &str) -> ClientInfo {
        ClientInfo::new(ip, "t1")
    }

    #[tokio::test]
    async fn login_validate_logout() {
        let svc = service();
        let resp = svc.login(&client("1.2.3.4"), &login_req(PASSWORD)).await.unwrap();
        assert!(resp.expires_at > now_unix() + 29 * 24 * 3600);
        assert!(resp.user.last_login_at.is_some());

        let session = svc.sessions().get_valid(&resp.session_id, "1.2.3.4").await.unwrap();
        assert_eq!(session.events[0].kind, EventType::Login);

        let err = svc.sessions().get_valid(&resp.session_id, "9.9.9.9").await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Authentication);

        svc.logout(&resp.session_id, &client("1.2.3.4")).await.unwrap();
        let err = svc.sessions().get_valid(&resp.session_id, "1.2.3.4").await.unwrap_err();
        assert!(matches!(err, AuthError::SessionRevoked));
    }

    #[tokio::test]
    async fn sixth_bad_login_is_rate_limited() {
        let svc = service_with(
            AuthConfig {
                login: LoginThrottleConfig {
                    max_attempts: 5,
                    window: Duration::from_secs(1),
                },
                ..AuthConfig::default()
            },
            None,
        );
        let ip = client("1.2.3.4");
        for _ in 0..5 {
            let err = svc.login(&ip, &login_req("wrong")).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }
        let err = svc.login(&ip, &login_req("wrong")).await.unwrap_err();
        assert!(matches!(err, AuthError::RateLimited));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let err = svc.login(&ip, &login_req("wrong")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn successful_login_resets_attempts() {
        let svc = service();
        let ip = client("1.2.3.4");
        for _ in 0..4 {
            let _ = svc.login(&ip, &login_req("wrong")).await;
        }
        svc.login(&ip, &login_req(PASSWORD)).await.unwrap();
        for _ in 0..5 {
            let err = svc.login(&ip, &login_req("wrong")).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }
    }

    #[tokio::test]
    async fn unknown_email_looks_like_bad_password() {
        let svc = service();
        let req = LoginRequest {
            email_address: "nobody@x.io".to_string(),
            password: PASSWORD.to_string(),
        };
        let err = svc.login(&client("1.2.3.4"), &req).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[test]
    fn unknown_user_hash_is_a_real_argon2_hash() {
        let hash = unknown_user_hash();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!verify_password(PASSWORD, hash).unwrap());
        assert!(std::ptr::eq(hash, unknown_user_hash()));
    }

    #[tokio::test]
    async fn malformed_request_is_validation_error() {
        let svc = service();
        let req = LoginRequest {
            email_address: "not-an-email".to_string(),
            password: String::new(),
        };
        let err = svc.login(&client("1.2.3.4"), &req).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn refresh_requires_matching_ip() {
        let svc = service();
        let resp = svc.login(&client("1.2.3.4"), &login_req(PASSWORD)).await.unwrap();
        svc.refresh(&resp.session_id, &client("1.2.3.4")).await.unwrap();
        assert!(svc.refresh(&resp.session_id, &client("9.9.9.9")).await.is_err());
    }

    #[tokio::test]
    async fn logout_of_unknown_session_fails() {
        let svc = service();
        let err = svc
            .logout(&Pulid::new(id::SESSION), &client("1.2.3.4"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionNotFound));
    }

    #[tokio::test]
    async fn check_email_reports_status() {
        let svc = service();
        let ok = svc
            .check_email(&CheckEmailRequest { email_address: EMAIL.to_string() })
            .await
            .unwrap();
        assert!(ok.valid);

        let missing = svc
            .check_email(&CheckEmailRequest { email_address: "no@x.io".to_string() })
            .await
            .unwrap();
        assert!(!missing.valid);
    }

    #[tokio::test]
    async fn switch_organization_checks_membership_and_records_event() {
        let extra = Pulid::new(id::ORGANIZATION);
        let svc = service_with(AuthConfig::default(), Some(&extra));
        let ip = client("1.2.3.4");
        let resp = svc.login(&ip, &login_req(PASSWORD)).await.unwrap();

        let err = svc
            .switch_organization(&resp.session_id, &ip, Pulid::new(id::ORGANIZATION))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Authorization);

        let session = svc
            .switch_organization(&resp.session_id, &ip, extra.clone())
            .await
            .unwrap();
        assert_eq!(session.organization_id, extra);
        let last = session.events.last().unwrap();
        assert_eq!(last.kind, EventType::OrgSwitched);
        assert_eq!(last.metadata.as_ref().unwrap()["to"], extra.as_str());
    }

    #[tokio::test]
    async fn revoke_all_sessions_logs_out_everywhere() {
        let svc = service();
        let a = svc.login(&client("1.2.3.4"), &login_req(PASSWORD)).await.unwrap();
        let b = svc.login(&client("5.6.7.8"), &login_req(PASSWORD)).await.unwrap();

        let listed = svc.list_sessions(&a.session_id, &client("1.2.3.4")).await.unwrap();
        assert_eq!(listed.len(), 2);

        let revoked = svc
            .revoke_all_sessions(&a.session_id, &client("1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        let b_session = svc.sessions().get(&b.session_id).await.unwrap();
        assert_eq!(b_session.status, SessionStatus::Revoked);
    }
}
