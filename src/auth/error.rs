use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::SessionError;
use crate::saml::{ConfigurationError, RequestError, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The SAML trust configuration is not loaded; login cannot proceed.
    #[error("SAML login is unavailable: {0}")]
    Unavailable(String),

    /// The IdP response failed validation.
    #[error("SAML response rejected: {0}")]
    Rejected(#[from] ValidationError),

    /// Internal error during authentication
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ConfigurationError> for AuthError {
    fn from(e: ConfigurationError) -> Self {
        AuthError::Unavailable(e.to_string())
    }
}

impl From<RequestError> for AuthError {
    fn from(e: RequestError) -> Self {
        AuthError::Internal(e.to_string())
    }
}

impl From<SessionError> for AuthError {
    fn from(e: SessionError) -> Self {
        AuthError::Internal(e.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        // Details stay in the logs; clients only learn which class of failure occurred.
        let (status, code, message) = match &self {
            AuthError::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "sso_unavailable",
                "Single sign-on is temporarily unavailable",
            ),
            AuthError::Rejected(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_failed",
                "Authentication failed",
            ),
            AuthError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal error",
            ),
        };

        let body = json!({
            "error": {
                "type": "authentication_error",
                "code": code,
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}
