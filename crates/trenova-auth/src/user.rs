//! Users and the repository seam the auth service reads them through.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use trenova_core::id::{self, Pulid};

use crate::config::BootstrapUser;
use crate::error::{AuthError, AuthResult};
use crate::password::{hash_password, verify_password};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Pulid,
    pub business_unit_id: Pulid,
    pub current_organization_id: Pulid,
    /// Every organization the user belongs to, including the current one.
    pub organization_ids: Vec<Pulid>,
    pub status: UserStatus,
    pub is_locked: bool,
    pub name: String,
    pub username: String,
    pub email_address: String,
    #[serde(skip)]
    pub password_hash: String,
    pub last_login_at: Option<i64>,
}

impl User {
    /// Status and lock checks first, then the password.
    pub fn verify_credentials(&self, password: &str) -> AuthResult<()> {
        self.ensure_can_login()?;
        if !verify_password(password, &self.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }

    pub fn ensure_can_login(&self) -> AuthResult<()> {
        if self.status != UserStatus::Active {
            return Err(AuthError::account_unavailable(
                "Your account is inactive. Please contact your system administrator.",
            ));
        }
        if self.is_locked {
            return Err(AuthError::account_unavailable(
                "Your account is locked. Please contact your system administrator.",
            ));
        }
        Ok(())
    }

    pub fn belongs_to(&self, organization_id: &Pulid) -> bool {
        self.organization_ids.contains(organization_id)
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Case-insensitive lookup.
    async fn find_by_email(&self, email: &str) -> AuthResult<Option<User>>;

    async fn find_by_id(&self, id: &Pulid) -> AuthResult<Option<User>>;

    async fn update_last_login(&self, id: &Pulid, at: i64) -> AuthResult<()>;
}

/// Repository held in memory, seeded from configuration.
#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<Pulid, User>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.users.write().insert(user.id.clone(), user);
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Hash each bootstrap password and build the users.
    pub fn from_bootstrap(users: &[BootstrapUser]) -> AuthResult<Self> {
        let repo = Self::new();
        for spec in users {
            let user = build_user(spec)?;
            tracing::info!(user_id = %user.id, email = %user.email_address, "bootstrap user registered");
            repo.insert(user);
        }
        Ok(repo)
    }
}

fn parse_or_new(raw: Option<&str>, prefix: id::Prefix, field: &str) -> AuthResult<Pulid> {
    match raw {
        Some(raw) => Pulid::parse(raw).map_err(|e| AuthError::validation(field, e.to_string())),
        None => Ok(Pulid::new(prefix)),
    }
}

fn build_user(spec: &BootstrapUser) -> AuthResult<User> {
    if spec.email_address.trim().is_empty() {
        return Err(AuthError::validation("emailAddress", "Email address is required"));
    }
    let id = parse_or_new(spec.user_id.as_deref(), id::USER, "userId")?;
    let business_unit_id = parse_or_new(
        spec.business_unit_id.as_deref(),
        id::BUSINESS_UNIT,
        "businessUnitId",
    )?;
    let current_organization_id = parse_or_new(
        spec.organization_id.as_deref(),
        id::ORGANIZATION,
        "organizationId",
    )?;

    let mut organization_ids = vec![current_organization_id.clone()];
    for raw in &spec.organizations {
        let org = Pulid::parse(raw).map_err(|e| AuthError::validation("organizations", e.to_string()))?;
        if !organization_ids.contains(&org) {
            organization_ids.push(org);
        }
    }

    Ok(User {
        id,
        business_unit_id,
        current_organization_id,
        organization_ids,
        status: if spec.active {
            UserStatus::Active
        } else {
            UserStatus::Inactive
        },
        is_locked: spec.locked,
        name: spec.name.clone(),
        username: spec.username.clone(),
        email_address: spec.email_address.trim().to_string(),
        password_hash: hash_password(&spec.password)?,
        last_login_at: None,
    })
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_email(&self, email: &str) -> AuthResult<Option<User>> {
        let email = email.trim();
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.email_address.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_id(&self, id: &Pulid) -> AuthResult<Option<User>> {
        Ok(self.users.read().get(id).cloned())
    }

    async fn update_last_login(&self, id: &Pulid, at: i64) -> AuthResult<()> {
        match self.users.write().get_mut(id) {
            Some(user) => {
                user.last_login_at = Some(at);
                Ok(())
            }
            None => Err(AuthError::UserNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap(email: &str) -> BootstrapUser {
        BootstrapUser {
            email_address: email.to_string(),
            password: "hunter2".to_string(),
            name: "Test".to_string(),
            username: "test".to_string(),
            ..BootstrapUser::default()
        }
    }

    #[tokio::test]
    async fn email_lookup_is_case_insensitive() {
        let repo = InMemoryUserRepository::from_bootstrap(&[bootstrap("E@X.io")]).unwrap();
        let user = repo.find_by_email(" e@x.io ").await.unwrap().unwrap();
        assert_eq!(user.email_address, "E@X.io");
        assert!(repo.find_by_email("other@x.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn credentials_check_status_then_password() {
        let mut spec = bootstrap("e@x.io");
        let user = build_user(&spec).unwrap();
        assert!(user.verify_credentials("hunter2").is_ok());
        assert!(matches!(
            user.verify_credentials("wrong"),
            Err(AuthError::InvalidCredentials)
        ));

        spec.active = false;
        let inactive = build_user(&spec).unwrap();
        assert!(matches!(
            inactive.verify_credentials("hunter2"),
            Err(AuthError::AccountUnavailable { .. })
        ));

        spec.active = true;
        spec.locked = true;
        let locked = build_user(&spec).unwrap();
        assert!(matches!(
            locked.verify_credentials("hunter2"),
            Err(AuthError::AccountUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn bootstrap_ids_are_parsed_and_orgs_merged() {
        let org = Pulid::new(id::ORGANIZATION);
        let extra = Pulid::new(id::ORGANIZATION);
        let spec = BootstrapUser {
            organization_id: Some(org.to_string()),
            organizations: vec![extra.to_string(), org.to_string()],
            ..bootstrap("e@x.io")
        };
        let user = build_user(&spec).unwrap();
        assert_eq!(user.current_organization_id, org);
        assert_eq!(user.organization_ids, vec![org.clone(), extra.clone()]);
        assert!(user.belongs_to(&extra));
    }

    #[test]
    fn malformed_bootstrap_id_is_rejected() {
        let spec = BootstrapUser {
            organization_id: Some("nope".to_string()),
            ..bootstrap("e@x.io")
        };
        assert!(matches!(
            build_user(&spec),
            Err(AuthError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn last_login_is_recorded() {
        let repo = InMemoryUserRepository::from_bootstrap(&[bootstrap("e@x.io")]).unwrap();
        let user = repo.find_by_email("e@x.io").await.unwrap().unwrap();
        repo.update_last_login(&user.id, 42).await.unwrap();
        let user = repo.find_by_id(&user.id).await.unwrap().unwrap();
        assert_eq!(user.last_login_at, Some(42));
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let user = build_user(&bootstrap("e@x.io")).unwrap();
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("passwordHash").is_none());
        assert_eq!(json["emailAddress"], "e@x.io");
    }
}
