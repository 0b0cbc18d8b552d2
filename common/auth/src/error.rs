use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use jsonwebtoken::errors::ErrorKind;
use thiserror::Error;
use tracing::debug;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token missing kid header")]
    MissingKeyId,
    #[error("no decoding key registered for kid '{0}'")]
    UnknownKeyId(String),
    #[error("failed to decode token header: {0}")]
    InvalidHeader(String),
    #[error("token expired")]
    Expired,
    #[error("token verification failed: {0}")]
    Verification(String),
    #[error("invalid claim '{0}' with value '{1}'")]
    InvalidClaim(&'static str, String),
    #[error("malformed claim payload: {0}")]
    InvalidJson(String),
    #[error("authorization header missing")]
    MissingAuthorization,
    #[error("authorization header malformed")]
    InvalidAuthorization,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        match value.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::Verification(value.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::MissingAuthorization | AuthError::InvalidAuthorization => {
                ApiError::Unauthorized {
                    code: "missing_token",
                    message: "Authentication required".to_string(),
                }
            }
            other => {
                debug!(reason = %other, "Rejected bearer token");
                ApiError::Unauthorized {
                    code: "invalid_token",
                    message: "Invalid or expired token".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
