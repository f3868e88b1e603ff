//! Authentication and session error types.
//!
//! Internally every failure keeps its precise kind (an IP mismatch is not a
//! revoked session). At the HTTP boundary every authentication failure,
//! credential or session, collapses to one message, so responses never
//! reveal which check failed.

use std::fmt;

use axum::response::{IntoResponse, Response};
use trenova_api::{ApiError, InvalidParam};
use trenova_cache::CacheError;

pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid credentials";
pub const RATE_LIMITED_MESSAGE: &str = "Too many login attempts. Please try again later.";

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request body is malformed or a field is invalid.
    #[error("Validation failed on {field}: {message}")]
    Validation { field: String, message: String },

    /// Unknown email or wrong password.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The account exists but may not sign in.
    #[error("Account unavailable: {message}")]
    AccountUnavailable { message: String },

    /// Too many login attempts for this (ip, user) pair.
    #[error("Rate limited")]
    RateLimited,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session revoked")]
    SessionRevoked,

    /// The session was created from a different address.
    #[error("Session IP mismatch: expected {expected}, got {actual}")]
    IpMismatch { expected: String, actual: String },

    /// No session cookie on a request that needs one.
    #[error("Missing session")]
    MissingSession,

    #[error("User not found")]
    UserNotFound,

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AuthError {
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn account_unavailable(message: impl Into<String>) -> Self {
        Self::AccountUnavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn ip_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::IpMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::InvalidCredentials
            | Self::SessionNotFound
            | Self::SessionExpired
            | Self::SessionRevoked
            | Self::IpMismatch { .. }
            | Self::MissingSession => ErrorCategory::Authentication,
            Self::AccountUnavailable { .. } | Self::Forbidden { .. } => {
                ErrorCategory::Authorization
            }
            Self::UserNotFound => ErrorCategory::NotFound,
            Self::RateLimited => ErrorCategory::RateLimited,
            Self::Cache(err) if err.is_transient() => ErrorCategory::Transient,
            Self::Cache(_) | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this is one of the session-validation failures.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound
                | Self::SessionExpired
                | Self::SessionRevoked
                | Self::IpMismatch { .. }
                | Self::MissingSession
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    RateLimited,
    /// Cache I/O failure or open circuit breaker.
    Transient,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Authentication => write!(f, "authentication"),
            Self::Authorization => write!(f, "authorization"),
            Self::NotFound => write!(f, "not_found"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Transient => write!(f, "transient"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Validation { field, message } => ApiError::validation(
                "The request contains invalid fields",
                vec![InvalidParam::new(field, message)],
            ),
            AuthError::InvalidCredentials
            | AuthError::SessionNotFound
            | AuthError::SessionExpired
            | AuthError::SessionRevoked
            | AuthError::IpMismatch { .. }
            | AuthError::MissingSession => ApiError::unauthorized(INVALID_CREDENTIALS_MESSAGE),
            AuthError::AccountUnavailable { message } | AuthError::Forbidden { message } => {
                ApiError::forbidden(message)
            }
            AuthError::UserNotFound => ApiError::not_found("User not found"),
            AuthError::RateLimited => ApiError::too_many_requests(
                RATE_LIMITED_MESSAGE,
                vec![InvalidParam::new("emailAddress", RATE_LIMITED_MESSAGE)],
            ),
            AuthError::Cache(err) if err.is_transient() => {
                ApiError::service_unavailable("Session service is temporarily unavailable")
            }
            AuthError::Cache(_) | AuthError::Internal { .. } => {
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self.category() {
            ErrorCategory::Internal => tracing::error!(error = %self, "auth request failed"),
            ErrorCategory::Transient => tracing::warn!(error = %self, "auth request degraded"),
            _ => tracing::debug!(error = %self, category = %self.category(), "auth request rejected"),
        }
        ApiError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            AuthError::validation("emailAddress", "required").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            AuthError::InvalidCredentials.category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            AuthError::ip_mismatch("1.2.3.4", "9.9.9.9").category(),
            ErrorCategory::Authentication
        );
        assert_eq!(AuthError::RateLimited.category(), ErrorCategory::RateLimited);
        assert_eq!(
            AuthError::Cache(CacheError::BreakerOpen).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            AuthError::Cache(CacheError::Command("x".into())).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn authentication_failures_share_public_message() {
        let errors = [
            AuthError::InvalidCredentials,
            AuthError::MissingSession,
            AuthError::SessionNotFound,
            AuthError::SessionExpired,
            AuthError::SessionRevoked,
            AuthError::ip_mismatch("1.2.3.4", "9.9.9.9"),
        ];
        for err in errors {
            let problem = ApiError::from(err).to_problem();
            assert_eq!(problem.status, 401);
            assert_eq!(problem.detail, INVALID_CREDENTIALS_MESSAGE);
        }
    }

    #[test]
    fn rate_limited_maps_to_429_with_email_param() {
        let api = ApiError::from(AuthError::RateLimited);
        assert_eq!(api.status_code(), StatusCode::TOO_MANY_REQUESTS);
        let problem = api.to_problem();
        assert_eq!(problem.invalid_params.len(), 1);
        assert_eq!(problem.invalid_params[0].name, "emailAddress");
        assert_eq!(problem.invalid_params[0].reason, RATE_LIMITED_MESSAGE);
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let problem = ApiError::from(AuthError::internal("db pool exhausted")).to_problem();
        assert!(!problem.detail.contains("pool"));
    }

    #[test]
    fn category_display() {
        assert_eq!(ErrorCategory::RateLimited.to_string(), "rate_limited");
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
    }
}
