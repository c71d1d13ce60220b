//! Portal error taxonomy.
//!
//! Every component returns `PortalError`; HTTP handlers convert it into a
//! JSON body `{"error": <kind>, "message": <detail>}` with a status code
//! matching the kind. Transient SSH/HTTP failures are retried inside the
//! components and never surface here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("invalid session name: {0}")]
    BadName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("tts unavailable: {0}")]
    TtsUnavailable(String),

    #[error("stt unavailable: {0}")]
    SttUnavailable(String),

    #[error("concurrency limit reached: {0}")]
    ConcurrencyLimit(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PortalError>;

impl PortalError {
    /// Stable machine-readable kind, used as the `error` field on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadName(_) => "BadName",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::Conflict(_) => "Conflict",
            Self::HostUnreachable(_) => "HostUnreachable",
            Self::TtsUnavailable(_) => "TtsUnavailable",
            Self::SttUnavailable(_) => "SttUnavailable",
            Self::ConcurrencyLimit(_) => "ConcurrencyLimit",
            Self::Timeout(_) => "Timeout",
            Self::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadName(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::HostUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::TtsUnavailable(_) | Self::SttUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConcurrencyLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<std::io::Error> for PortalError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            tracing::error!("internal error surfaced to client: {}", self);
        }
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(PortalError::BadName("x".into()).kind(), "BadName");
        assert_eq!(PortalError::Timeout("x".into()).kind(), "Timeout");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            PortalError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PortalError::AlreadyExists("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PortalError::ConcurrencyLimit("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
