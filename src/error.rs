//! Error taxonomy shared by the HTTP surface and the agent broker.
//!
//! Every failure that can leave the gateway is a [`GatewayError`].  The HTTP
//! layer renders it as `{code, message}` with a status code; the broker maps
//! the same code onto an `error` envelope or a failed `tool_result`.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::safety::Severity;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or malformed authorization header")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("credential has expired")]
    ExpiredCredential,
    #[error("credential has been revoked")]
    RevokedCredential,
    #[error("credential is not permitted to access {0}")]
    PermissionDenied(String),
    #[error("rate limit exceeded")]
    QuotaExceeded {
        limit: u64,
        remaining: u64,
        reset_seconds: u64,
    },
    #[error("request blocked by safety policy: {message}")]
    PolicyViolation {
        severity: Severity,
        pattern: String,
        message: String,
    },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("server '{0}' not found")]
    ServerNotFound(String),
    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend returned status {status}: {message}")]
    BackendError { status: u16, message: String },
    #[error("backend timed out after {0}ms")]
    BackendTimeout(u64),
    #[error("internal error")]
    InternalError(String),
}

/// Wire body for every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingCredential => "missing_credential",
            GatewayError::InvalidCredential => "invalid_credential",
            GatewayError::ExpiredCredential => "expired_credential",
            GatewayError::RevokedCredential => "revoked_credential",
            GatewayError::PermissionDenied(_) => "permission_denied",
            GatewayError::QuotaExceeded { .. } => "rate_limit_exceeded",
            GatewayError::PolicyViolation { .. } => "policy_violation",
            GatewayError::MalformedMessage(_) => "invalid_message",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::ServerNotFound(_) => "server_not_found",
            GatewayError::ConnectionNotFound(_) => "connection_not_found",
            GatewayError::BackendUnavailable(_) => "backend_unavailable",
            GatewayError::BackendError { .. } => "backend_error",
            GatewayError::BackendTimeout(_) => "backend_timeout",
            GatewayError::InternalError(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingCredential
            | GatewayError::InvalidCredential
            | GatewayError::ExpiredCredential
            | GatewayError::RevokedCredential => StatusCode::UNAUTHORIZED,
            GatewayError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::PolicyViolation { .. }
            | GatewayError::MalformedMessage(_)
            | GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ServerNotFound(_) | GatewayError::ConnectionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::BackendUnavailable(_) | GatewayError::BackendError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the failures that the audit trail records as `blocked`
    /// rather than `failure`.
    pub fn is_block(&self) -> bool {
        matches!(
            self,
            GatewayError::QuotaExceeded { .. }
                | GatewayError::PolicyViolation { .. }
                | GatewayError::PermissionDenied(_)
        )
    }

    pub fn body(&self) -> ErrorBody {
        let details = match self {
            GatewayError::QuotaExceeded {
                limit,
                remaining,
                reset_seconds,
            } => Some(serde_json::json!({
                "limit": limit,
                "remaining": remaining,
                "reset_seconds": reset_seconds,
            })),
            GatewayError::PolicyViolation {
                severity, pattern, ..
            } => Some(serde_json::json!({
                "severity": severity,
                "pattern": pattern,
            })),
            _ => None,
        };
        // Internal details stay in the log, never on the wire.
        let message = match self {
            GatewayError::InternalError(_) => "an internal error occurred".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code().to_string(),
            message,
            details,
        }
    }
}

/// Standard rate limit headers, shared by admitted responses and 429s.
pub fn rate_limit_headers(headers: &mut HeaderMap, limit: u64, remaining: u64, reset: u64) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset));
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(self.body())).into_response();
        if let GatewayError::QuotaExceeded {
            limit,
            remaining,
            reset_seconds,
        } = self
        {
            let headers = response.headers_mut();
            rate_limit_headers(headers, limit, remaining, reset_seconds);
            headers.insert("retry-after", HeaderValue::from(reset_seconds));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_error_carries_retry_headers() {
        let err = GatewayError::QuotaExceeded {
            limit: 1,
            remaining: 0,
            reset_seconds: 42,
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["retry-after"], "42");
        assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn internal_error_hides_detail() {
        let body = GatewayError::InternalError("db exploded".into()).body();
        assert_eq!(body.code, "internal_error");
        assert!(!body.message.contains("db exploded"));
    }

    #[test]
    fn policy_violation_is_a_block() {
        let err = GatewayError::PolicyViolation {
            severity: Severity::High,
            pattern: "jailbreak".into(),
            message: "Prompt injection detected".into(),
        };
        assert!(err.is_block());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let body = err.body();
        assert_eq!(body.details.unwrap()["severity"], "high");
    }
}
