use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::account::store::StoreError;
use crate::cache::CacheError;

#[derive(Debug)]
pub enum AppError {
    /// Flow state token absent, expired, already consumed, or bound to a
    /// different provider. Deliberately indistinguishable to the caller.
    InvalidState(String),
    InvalidProvider(String),
    /// Generic credential failure. The payload is for logs only and never
    /// reaches the response body.
    AuthFailed(String),
    AccountLocked,
    AccountUnverified,
    AccountSuspended,
    UserExists,
    UserNotFound,
    TokenInvalid(String),
    TokenExpired,
    Validation(String),
    Cache(CacheError),
    Store(StoreError),
    Config(config::ConfigError),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InvalidState(_) => write!(f, "Invalid or expired state token"),
            AppError::InvalidProvider(name) => write!(f, "Unknown provider: {}", name),
            AppError::AuthFailed(_) => write!(f, "Authentication failed"),
            AppError::AccountLocked => write!(f, "Account temporarily locked"),
            AppError::AccountUnverified => write!(f, "Account email not verified"),
            AppError::AccountSuspended => write!(f, "Account suspended"),
            AppError::UserExists => write!(f, "An account with this email already exists"),
            AppError::UserNotFound => write!(f, "No account found"),
            AppError::TokenInvalid(_) => write!(f, "Invalid token"),
            AppError::TokenExpired => write!(f, "Token expired"),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::Cache(err) => write!(f, "Cache error: {}", err),
            AppError::Store(err) => write!(f, "Store error: {}", err),
            AppError::Config(err) => write!(f, "Configuration error: {}", err),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        AppError::Cache(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AppError::InvalidState(_) => (StatusCode::BAD_REQUEST, "invalid_state"),
            AppError::InvalidProvider(_) => (StatusCode::BAD_REQUEST, "invalid_provider"),
            AppError::AuthFailed(_) => (StatusCode::UNAUTHORIZED, "auth_failed"),
            AppError::AccountLocked => (StatusCode::FORBIDDEN, "account_locked"),
            AppError::AccountUnverified => (StatusCode::FORBIDDEN, "account_unverified"),
            AppError::AccountSuspended => (StatusCode::FORBIDDEN, "account_suspended"),
            AppError::UserExists => (StatusCode::CONFLICT, "user_exists"),
            AppError::UserNotFound => (StatusCode::NOT_FOUND, "user_not_found"),
            AppError::TokenInvalid(_) => (StatusCode::UNAUTHORIZED, "token_invalid"),
            AppError::TokenExpired => (StatusCode::UNAUTHORIZED, "token_expired"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Cache(_) | AppError::Store(_) | AppError::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": error_code,
            "message": self.to_string()
        }));

        (status, body).into_response()
    }
}
