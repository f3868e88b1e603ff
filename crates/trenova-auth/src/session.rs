//! Session model and validation rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use trenova_core::id::{self, Pulid};
use trenova_core::{now_unix, unix_after};

use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Login,
    Accessed,
    Revoked,
    OrgSwitched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub ip: String,
    pub user_agent: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SessionEvent {
    pub fn new(kind: EventType, ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            kind,
            ip: ip.into(),
            user_agent: user_agent.into(),
            timestamp: now_unix(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Server-side record of an authenticated user agent, bound to its origin IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Pulid,
    pub user_id: Pulid,
    pub business_unit_id: Pulid,
    pub organization_id: Pulid,
    pub status: SessionStatus,
    pub ip: String,
    pub user_agent: String,
    pub last_accessed_at: i64,
    pub expires_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub events: Vec<SessionEvent>,

    /// Set on sessions synthesized while the cache is unreachable.
    #[serde(skip)]
    pub fallback: bool,
}

impl Session {
    /// A new active session. The caller records the `Login` event.
    pub fn new(
        user_id: Pulid,
        business_unit_id: Pulid,
        organization_id: Pulid,
        ip: impl Into<String>,
        user_agent: impl Into<String>,
        lifetime: Duration,
    ) -> Self {
        let now = now_unix();
        Self {
            id: Pulid::new(id::SESSION),
            user_id,
            business_unit_id,
            organization_id,
            status: SessionStatus::Active,
            ip: ip.into(),
            user_agent: user_agent.into(),
            last_accessed_at: now,
            expires_at: unix_after(lifetime),
            created_at: now,
            updated_at: now,
            events: Vec::new(),
            fallback: false,
        }
    }

    /// Degraded stand-in used while the cache breaker is open.
    ///
    /// Keeps the requested id and binds to `ip`, but user, business unit and
    /// organization are synthetic and must not be trusted.
    pub fn fallback(id: Pulid, ip: impl Into<String>, ttl: Duration) -> Self {
        let now = now_unix();
        Self {
            id,
            user_id: Pulid::new(id::USER),
            business_unit_id: Pulid::new(id::BUSINESS_UNIT),
            organization_id: Pulid::new(id::ORGANIZATION),
            status: SessionStatus::Active,
            ip: ip.into(),
            user_agent: String::new(),
            last_accessed_at: now,
            expires_at: unix_after(ttl),
            created_at: now,
            updated_at: now,
            events: Vec::new(),
            fallback: true,
        }
    }

    pub fn is_expired(&self) -> bool {
        now_unix() >= self.expires_at
    }

    /// Active and not expired. Does not check the IP.
    pub fn is_valid(&self) -> bool {
        self.status == SessionStatus::Active && !self.is_expired()
    }

    /// Full validation against the caller's address.
    pub fn validate(&self, client_ip: &str) -> AuthResult<()> {
        match self.status {
            SessionStatus::Revoked => return Err(AuthError::SessionRevoked),
            SessionStatus::Expired => return Err(AuthError::SessionExpired),
            SessionStatus::Active => {}
        }
        if self.is_expired() {
            return Err(AuthError::SessionExpired);
        }
        if self.ip != client_ip {
            return Err(AuthError::ip_mismatch(&self.ip, client_ip));
        }
        Ok(())
    }

    pub fn add_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub fn touch(&mut self) {
        let now = now_unix();
        self.last_accessed_at = now;
        self.updated_at = now;
    }

    /// Seconds until `expiresAt`, zero once passed.
    pub fn remaining(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.expires_at - now_unix()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(ip: &str) -> Session {
        Session::new(
            Pulid::new(id::USER),
            Pulid::new(id::BUSINESS_UNIT),
            Pulid::new(id::ORGANIZATION),
            ip,
            "t1",
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn new_session_is_active_and_bound_to_ip() {
        let s = session("1.2.3.4");
        assert!(s.id.has_prefix(id::SESSION));
        assert!(s.is_valid());
        assert!(s.validate("1.2.3.4").is_ok());
    }

    #[test]
    fn ip_mismatch_is_distinct() {
        let s = session("1.2.3.4");
        assert!(matches!(
            s.validate("9.9.9.9"),
            Err(AuthError::IpMismatch { .. })
        ));
    }

    #[test]
    fn revoked_takes_precedence_over_ip() {
        let mut s = session("1.2.3.4");
        s.status = SessionStatus::Revoked;
        assert!(!s.is_valid());
        assert!(matches!(
            s.validate("9.9.9.9"),
            Err(AuthError::SessionRevoked)
        ));
    }

    #[test]
    fn past_expiry_is_expired() {
        let mut s = session("1.2.3.4");
        s.expires_at = now_unix() - 1;
        assert!(matches!(
            s.validate("1.2.3.4"),
            Err(AuthError::SessionExpired)
        ));
        assert_eq!(s.remaining(), Duration::ZERO);
    }

    #[test]
    fn fallback_is_short_lived_and_flagged() {
        let id = Pulid::new(id::SESSION);
        let s = Session::fallback(id.clone(), "1.2.3.4", Duration::from_secs(300));
        assert!(s.fallback);
        assert_eq!(s.id, id);
        assert!(s.events.is_empty());
        assert!(s.expires_at - now_unix() <= 300);
        assert!(s.validate("1.2.3.4").is_ok());
    }

    #[test]
    fn serializes_camel_case_with_event_type() {
        let mut s = session("1.2.3.4");
        s.add_event(SessionEvent::new(EventType::Login, "1.2.3.4", "t1"));
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("expiresAt").is_some());
        assert!(json.get("fallback").is_none());
        assert_eq!(json["status"], "active");
        assert_eq!(json["events"][0]["type"], "login");

        let back: Session = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }
}
