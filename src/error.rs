//! Unified application error model and mapping helpers.
//! This module provides a common error enum used by the HTTP boundary and the
//! signing flow, along with the HTTP status mapping and JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ApiError {
    BadRequest { detail: String },
    Unauthenticated { detail: String },
    AuthFailed { detail: String },
    PolicyDenied { detail: String },
    NotReady { detail: String },
    Conflict { detail: String },
    SignerSealed { detail: String },
    UpstreamUnavailable { detail: String },
    Timeout { detail: String },
    Internal { detail: String },
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest { .. } => "bad_request",
            ApiError::Unauthenticated { .. } => "unauthenticated",
            ApiError::AuthFailed { .. } => "auth_failed",
            ApiError::PolicyDenied { .. } => "policy_denied",
            ApiError::NotReady { .. } => "not_ready",
            ApiError::Conflict { .. } => "conflict",
            ApiError::SignerSealed { .. } => "signer_sealed",
            ApiError::UpstreamUnavailable { .. } => "upstream_unavailable",
            ApiError::Timeout { .. } => "timeout",
            ApiError::Internal { .. } => "internal",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ApiError::BadRequest { detail }
            | ApiError::Unauthenticated { detail }
            | ApiError::AuthFailed { detail }
            | ApiError::PolicyDenied { detail }
            | ApiError::NotReady { detail }
            | ApiError::Conflict { detail }
            | ApiError::SignerSealed { detail }
            | ApiError::UpstreamUnavailable { detail }
            | ApiError::Timeout { detail }
            | ApiError::Internal { detail } => detail.as_str(),
        }
    }

    pub fn bad_request<S: Into<String>>(d: S) -> Self { ApiError::BadRequest { detail: d.into() } }
    pub fn unauthenticated<S: Into<String>>(d: S) -> Self { ApiError::Unauthenticated { detail: d.into() } }
    pub fn auth_failed<S: Into<String>>(d: S) -> Self { ApiError::AuthFailed { detail: d.into() } }
    pub fn policy_denied<S: Into<String>>(d: S) -> Self { ApiError::PolicyDenied { detail: d.into() } }
    pub fn not_ready<S: Into<String>>(d: S) -> Self { ApiError::NotReady { detail: d.into() } }
    pub fn conflict<S: Into<String>>(d: S) -> Self { ApiError::Conflict { detail: d.into() } }
    pub fn signer_sealed<S: Into<String>>(d: S) -> Self { ApiError::SignerSealed { detail: d.into() } }
    pub fn upstream<S: Into<String>>(d: S) -> Self { ApiError::UpstreamUnavailable { detail: d.into() } }
    pub fn timeout<S: Into<String>>(d: S) -> Self { ApiError::Timeout { detail: d.into() } }
    pub fn internal<S: Into<String>>(d: S) -> Self { ApiError::Internal { detail: d.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            ApiError::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
            ApiError::PolicyDenied { .. } => StatusCode::FORBIDDEN,
            ApiError::NotReady { .. } => StatusCode::CONFLICT,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::SignerSealed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON error body: `{"error": <kind>, "detail": <detail>}`.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.kind(), "detail": self.detail() })
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.detail())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.http_status(), Json(self.body())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal { detail: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ApiError::bad_request("x").http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::unauthenticated("x").http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::auth_failed("x").http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::policy_denied("x").http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_ready("x").http_status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::conflict("x").http_status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::signer_sealed("x").http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::upstream("x").http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::timeout("x").http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::internal("x").http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn body_names_kind_and_detail() {
        let body = ApiError::auth_failed("authenticator pw rejected credentials").body();
        assert_eq!(body["error"], "auth_failed");
        assert_eq!(body["detail"], "authenticator pw rejected credentials");
    }
}
