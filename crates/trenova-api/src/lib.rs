use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PROBLEM_JSON: &str = "application/problem+json";

/// A single field-level validation failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidParam {
    pub name: String,
    pub reason: String,
}

impl InvalidParam {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Problem-details body returned for every application error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_params: Vec<InvalidParam>,
}

/// High-level API errors to be mapped to HTTP responses and problem details
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Validation failed: {detail}")]
    Validation {
        detail: String,
        params: Vec<InvalidParam>,
    },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Too many requests: {detail}")]
    TooManyRequests {
        detail: String,
        params: Vec<InvalidParam>,
    },
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
    pub fn validation(detail: impl Into<String>, params: Vec<InvalidParam>) -> Self {
        Self::Validation {
            detail: detail.into(),
            params,
        }
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn too_many_requests(detail: impl Into<String>, params: Vec<InvalidParam>) -> Self {
        Self::TooManyRequests {
            detail: detail.into(),
            params,
        }
    }
    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind_and_title(&self) -> (&'static str, &'static str) {
        match self {
            ApiError::BadRequest(_) => ("bad-request", "Bad Request"),
            ApiError::Validation { .. } => ("validation-error", "Validation Failed"),
            ApiError::Unauthorized(_) => ("authentication-error", "Authentication Failed"),
            ApiError::Forbidden(_) => ("authorization-error", "Access Denied"),
            ApiError::NotFound(_) => ("not-found", "Resource Not Found"),
            ApiError::TooManyRequests { .. } => ("rate-limit-exceeded", "Too Many Requests"),
            ApiError::ServiceUnavailable(_) => ("service-unavailable", "Service Unavailable"),
            ApiError::Internal(_) => ("internal-error", "Internal Server Error"),
        }
    }

    pub fn to_problem(&self) -> ProblemDetails {
        let (kind, title) = self.kind_and_title();
        let (detail, params) = match self {
            ApiError::Validation { detail, params }
            | ApiError::TooManyRequests { detail, params } => (detail.clone(), params.clone()),
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::ServiceUnavailable(msg)
            | ApiError::Internal(msg) => (msg.clone(), Vec::new()),
        };
        ProblemDetails {
            kind: kind.to_string(),
            title: title.to_string(),
            status: self.status_code().as_u16(),
            detail,
            instance: None,
            invalid_params: params,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::to_vec(&self.to_problem()).unwrap_or_else(|_| b"{}".to_vec());

        let mut response = (status, body).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_response_sets_status_and_content_type() {
        let resp = ApiError::bad_request("Invalid parameter").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let content_type = resp.headers().get(header::CONTENT_TYPE).unwrap();
        assert_eq!(content_type, &HeaderValue::from_static(PROBLEM_JSON));
    }

    #[test]
    fn validation_problem_carries_invalid_params() {
        let err = ApiError::validation(
            "Request has invalid fields",
            vec![InvalidParam::new("emailAddress", "Email address is required")],
        );
        let value = serde_json::to_value(err.to_problem()).unwrap();
        assert_eq!(value["type"], "validation-error");
        assert_eq!(value["status"], 400);
        assert_eq!(value["invalidParams"][0]["name"], "emailAddress");
        assert!(value.get("instance").is_none());
    }

    #[test]
    fn plain_errors_omit_invalid_params() {
        let value = serde_json::to_value(ApiError::unauthorized("nope").to_problem()).unwrap();
        assert!(value.get("invalidParams").is_none());
        assert_eq!(value["detail"], "nope");
    }

    #[test]
    fn api_error_variants_map_to_status() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (ApiError::bad_request("x"), StatusCode::BAD_REQUEST),
            (ApiError::validation("x", vec![]), StatusCode::BAD_REQUEST),
            (ApiError::unauthorized("x"), StatusCode::UNAUTHORIZED),
            (ApiError::forbidden("x"), StatusCode::FORBIDDEN),
            (ApiError::not_found("x"), StatusCode::NOT_FOUND),
            (
                ApiError::too_many_requests("x", vec![]),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ApiError::service_unavailable("x"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ApiError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status);
            assert_eq!(err.to_problem().status, status.as_u16());
        }
    }
}
