// Error handling module
// Defines error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// Caller failed the proxy API key check
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// OAuth callback carried an unknown or expired state
    #[error("Unknown consent state: {0}")]
    UnknownConsent(String),

    /// Credential manager is no longer running
    #[error("Credential manager unavailable")]
    ManagerUnavailable,

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::AuthError(msg) => (StatusCode::UNAUTHORIZED, "auth_error", msg),
            ApiError::UnknownConsent(state) => (
                StatusCode::BAD_REQUEST,
                "unknown_consent",
                format!("No pending sign-in for state {}", state),
            ),
            ApiError::ManagerUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "manager_unavailable",
                "Credential manager is shutting down".to_string(),
            ),
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// The credential manager task has stopped and no longer accepts commands
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Credential manager has shut down")]
pub struct ManagerClosed;

impl From<ManagerClosed> for ApiError {
    fn from(_: ManagerClosed) -> Self {
        ApiError::ManagerUnavailable
    }
}

/// Failures of the consent flow, the refresh call and the credential store
#[derive(Error, Debug)]
pub enum AuthError {
    /// Consent flow was denied or cancelled by the user
    #[error("Consent flow failed: {0}")]
    ConsentDenied(String),

    /// No callback arrived before the consent deadline
    #[error("Consent flow timed out after {0}s")]
    ConsentTimeout(u64),

    /// Refresh token was rejected permanently (invalid_grant)
    #[error("Refresh token revoked: {0}")]
    Revoked(String),

    /// Non-success status from the Google token endpoint
    #[error("Google OAuth error: {status} - {message}")]
    Upstream { status: u16, message: String },

    /// Token endpoint answered with a body we could not use
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// Transport failure talking to Google
    #[error("HTTP request failed: {0}")]
    Transport(String),

    /// Credential store read or write failed
    #[error("Credential store error: {0}")]
    Storage(String),
}

impl AuthError {
    /// Short category used in status snapshots and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::ConsentDenied(_) | AuthError::ConsentTimeout(_) => "consent",
            AuthError::Revoked(_) => "revoked",
            AuthError::Upstream { .. }
            | AuthError::InvalidResponse(_)
            | AuthError::Transport(_) => "refresh",
            AuthError::Storage(_) => "storage",
        }
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
