//! Cached session store with fallback when the cache breaker is open.
//!
//! Layout:
//! - `session:<id>` holds the JSON session document
//! - `user-sessions:<user_id>` is a set of the user's active session ids
//!
//! Both keys share the storage TTL. Create writes them in one pipeline;
//! revoke writes the document first and removes the index entry second.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use trenova_cache::{CacheError, CacheStore, CacheStoreExt, PipelineOp, ROOT_PATH};
use trenova_core::Pulid;

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::session::{EventType, Session, SessionEvent, SessionStatus};

pub fn session_key(id: &Pulid) -> String {
    format!("session:{id}")
}

pub fn user_sessions_key(user_id: &Pulid) -> String {
    format!("user-sessions:{user_id}")
}

#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn CacheStore>,
    storage_ttl: Duration,
    fallback_ttl: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn CacheStore>, config: &AuthConfig) -> Self {
        Self {
            cache,
            storage_ttl: config.session_storage_ttl,
            fallback_ttl: config.fallback_session_ttl,
        }
    }

    pub fn storage_ttl(&self) -> Duration {
        self.storage_ttl
    }

    /// Persist a new session and index it under its user.
    pub async fn create(&self, session: &Session) -> AuthResult<()> {
        if session.events.first().map(|e| e.kind) != Some(EventType::Login) {
            return Err(AuthError::internal(
                "session must carry its login event before persistence",
            ));
        }

        let key = session_key(&session.id);
        let index = user_sessions_key(&session.user_id);
        let value = serde_json::to_value(session).map_err(CacheError::from)?;

        self.cache
            .exec_pipeline(vec![
                PipelineOp::SetJson {
                    key: key.clone(),
                    path: ROOT_PATH.to_string(),
                    value,
                },
                PipelineOp::Expire {
                    key,
                    ttl: self.storage_ttl,
                },
                PipelineOp::SAdd {
                    key: index.clone(),
                    member: session.id.to_string(),
                },
                PipelineOp::Expire {
                    key: index,
                    ttl: self.storage_ttl,
                },
            ])
            .await?;

        tracing::debug!(session_id = %session.id, user_id = %session.user_id, "session created");
        Ok(())
    }

    /// Raw read with no validation.
    pub async fn get(&self, id: &Pulid) -> AuthResult<Session> {
        match self.cache.get_typed::<Session>(&session_key(id)).await {
            Ok(session) => Ok(session),
            Err(err) if err.is_not_found() => Err(AuthError::SessionNotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Read and validate against `client_ip`.
    ///
    /// While the cache breaker is open this returns a short-lived fallback
    /// session flagged with [`Session::fallback`].
    pub async fn get_valid(&self, id: &Pulid, client_ip: &str) -> AuthResult<Session> {
        let session = match self.get(id).await {
            Ok(session) => session,
            Err(AuthError::Cache(err)) if err.is_breaker_open() => {
                tracing::warn!(
                    session_id = %id,
                    client_ip = %client_ip,
                    "cache unavailable, issuing fallback session"
                );
                return Ok(Session::fallback(id.clone(), client_ip, self.fallback_ttl));
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = session.validate(client_ip) {
            if let AuthError::IpMismatch { expected, actual } = &err {
                tracing::warn!(
                    session_id = %id,
                    expected_ip = %expected,
                    client_ip = %actual,
                    "session ip mismatch"
                );
            }
            return Err(err);
        }
        Ok(session)
    }

    /// Stamp `lastAccessedAt` and rewrite the document with a fresh TTL.
    ///
    /// `event` is accepted for the caller's bookkeeping and not appended; use
    /// [`SessionStore::append_event`] to record it.
    pub async fn update_activity(
        &self,
        id: &Pulid,
        client_ip: &str,
        user_agent: &str,
        event: EventType,
    ) -> AuthResult<Session> {
        let mut session = self.get_valid(id, client_ip).await?;
        if session.fallback {
            return Ok(session);
        }

        session.touch();
        self.save(&session).await?;
        tracing::trace!(
            session_id = %id,
            user_agent = %user_agent,
            event = ?event,
            "session activity updated"
        );
        Ok(session)
    }

    /// Administrative org change; skips the IP check.
    pub async fn update_organization(
        &self,
        id: &Pulid,
        organization_id: Pulid,
    ) -> AuthResult<Session> {
        let mut session = self.get(id).await?;
        session.organization_id = organization_id;
        session.updated_at = trenova_core::now_unix();
        self.save(&session).await?;
        Ok(session)
    }

    pub async fn append_event(&self, id: &Pulid, event: SessionEvent) -> AuthResult<Session> {
        let mut session = self.get(id).await?;
        session.add_event(event);
        session.updated_at = trenova_core::now_unix();
        self.save(&session).await?;
        Ok(session)
    }

    /// Revoke an IP-matched session and drop it from the user index.
    pub async fn revoke(
        &self,
        id: &Pulid,
        client_ip: &str,
        user_agent: &str,
        reason: &str,
    ) -> AuthResult<Session> {
        let session = self.get_valid(id, client_ip).await?;
        if session.fallback {
            return Err(CacheError::BreakerOpen.into());
        }
        self.revoke_loaded(session, client_ip, user_agent, reason)
            .await
    }

    /// Active, unexpired sessions of a user. Stale index members are pruned.
    pub async fn active_by_user(&self, user_id: &Pulid) -> AuthResult<Vec<Session>> {
        let index = user_sessions_key(user_id);
        let members = self.cache.smembers(&index).await?;

        let mut active = Vec::with_capacity(members.len());
        let mut stale = Vec::new();
        for member in members {
            let Ok(id) = Pulid::parse(&member) else {
                stale.push(member);
                continue;
            };
            match self.get(&id).await {
                Ok(session) if session.is_valid() => active.push(session),
                Ok(_) | Err(AuthError::SessionNotFound) => stale.push(member),
                Err(err) => return Err(err),
            }
        }

        for member in stale {
            if let Err(err) = self.cache.srem(&index, &member).await {
                tracing::debug!(user_id = %user_id, session_id = %member, error = %err, "failed to prune session index");
            }
        }
        Ok(active)
    }

    /// Revoke every active session of a user; returns how many were revoked.
    ///
    /// One failure does not stop the others.
    pub async fn revoke_all_by_user(&self, user_id: &Pulid, reason: &str) -> AuthResult<usize> {
        let sessions = self.active_by_user(user_id).await?;
        let mut revoked = 0;
        for session in sessions {
            let id = session.id.clone();
            let ip = session.ip.clone();
            let user_agent = session.user_agent.clone();
            match self.revoke_loaded(session, &ip, &user_agent, reason).await {
                Ok(_) => revoked += 1,
                Err(err) => {
                    tracing::warn!(session_id = %id, user_id = %user_id, error = %err, "failed to revoke session");
                }
            }
        }
        Ok(revoked)
    }

    async fn revoke_loaded(
        &self,
        mut session: Session,
        client_ip: &str,
        user_agent: &str,
        reason: &str,
    ) -> AuthResult<Session> {
        session.status = SessionStatus::Revoked;
        session.updated_at = trenova_core::now_unix();
        session.add_event(
            SessionEvent::new(EventType::Revoked, client_ip, user_agent)
                .with_metadata(json!({ "reason": reason })),
        );
        self.save(&session).await?;

        let index = user_sessions_key(&session.user_id);
        if let Err(err) = self.cache.srem(&index, session.id.as_str()).await {
            tracing::warn!(
                session_id = %session.id,
                user_id = %session.user_id,
                error = %err,
                "revoked session left in user index"
            );
        }
        tracing::info!(session_id = %session.id, user_id = %session.user_id, reason = %reason, "session revoked");
        Ok(session)
    }

    async fn save(&self, session: &Session) -> AuthResult<()> {
        self.cache
            .set_typed(&session_key(&session.id), session, Some(self.storage_ttl))
            .await?;
        Ok(())
    }
}
