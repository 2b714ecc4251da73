//! Application error types shared by HTTP handlers, the session protocol and the stores.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Persistence(e.to_string())
    }
}

impl AppError {
    /// Stable machine-readable code, also sent in WebSocket error events.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "E_NOT_FOUND",
            AppError::Forbidden(_) => "E_FORBIDDEN",
            AppError::Validation(_) => "E_VALIDATION",
            AppError::Persistence(_) => "E_PERSISTENCE",
            AppError::Redis(_) => "E_BROADCAST",
            AppError::Serialization(_) => "E_PAYLOAD",
            AppError::Unauthenticated(_) => "E_UNAUTHENTICATED",
            AppError::Internal(_) => "E_INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::Serialization(_) => StatusCode::BAD_REQUEST,
            AppError::Persistence(_) | AppError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({ "error": self.to_string(), "code": self.error_code() }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_status() {
        assert_eq!(AppError::NotFound("room".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::Persistence("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Unauthenticated("no token".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn sqlx_errors_are_persistence_failures() {
        let err: AppError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.error_code(), "E_PERSISTENCE");
    }
}
