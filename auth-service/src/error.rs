use axum::response::{IntoResponse, Response};
use common_auth::AuthError;
use common_http_errors::{ApiError, FieldError};
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use crate::store::{IdentityField, StoreError};

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Outcomes of the core operations. Translated to HTTP exactly once, in
/// `From<ServiceError> for ApiError`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed on {} field(s)", .0.len())]
    Validation(Vec<FieldError>),
    #[error("{} is already in use", .field.as_str())]
    DuplicateIdentity { field: IdentityField },
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("authentication required")]
    Unauthenticated,
    #[error("account disabled")]
    AccountDisabled,
    #[error("access denied")]
    AuthorizationDenied,
    #[error("user not found")]
    UserNotFound,
    #[error("{0} not found")]
    ResourceNotFound(&'static str),
    #[error("{0}")]
    IllegalState(String),
    #[error("current password is incorrect")]
    IncorrectPassword,
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn last_admin() -> Self {
        ServiceError::IllegalState(
            "Operation would leave the system without an active administrator".to_string(),
        )
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::DuplicateIdentity { field } => ServiceError::DuplicateIdentity { field },
            StoreError::NotFound => ServiceError::UserNotFound,
            StoreError::LastAdmin => ServiceError::last_admin(),
            StoreError::Backend(err) => ServiceError::Unexpected(err),
        }
    }
}

impl From<AuthError> for ServiceError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::MissingAuthorization | AuthError::InvalidAuthorization => {
                ServiceError::Unauthenticated
            }
            other => {
                debug!(reason = %other, "Token rejected");
                ServiceError::InvalidToken
            }
        }
    }
}

fn capitalised(field: IdentityField) -> &'static str {
    match field {
        IdentityField::Email => "Email",
        IdentityField::Username => "Username",
    }
}

impl From<ServiceError> for ApiError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::Validation(errors) => ApiError::validation(errors),
            ServiceError::DuplicateIdentity { field } => ApiError::Conflict {
                code: "duplicate_identity",
                message: format!("{} is already in use", capitalised(field)),
            },
            ServiceError::InvalidCredentials => ApiError::Unauthorized {
                code: "invalid_credentials",
                message: "Invalid email or password".to_string(),
            },
            ServiceError::InvalidToken => ApiError::Unauthorized {
                code: "invalid_token",
                message: "Invalid or expired token".to_string(),
            },
            ServiceError::Unauthenticated => ApiError::Unauthorized {
                code: "missing_token",
                message: "Authentication required".to_string(),
            },
            ServiceError::AccountDisabled => ApiError::Forbidden {
                code: "account_disabled",
                message: "Account is disabled".to_string(),
            },
            ServiceError::AuthorizationDenied => ApiError::Forbidden {
                code: "access_denied",
                message: "You do not have permission to perform this action".to_string(),
            },
            ServiceError::UserNotFound => ApiError::NotFound {
                code: "user_not_found",
                message: "User not found".to_string(),
            },
            ServiceError::ResourceNotFound(resource) => ApiError::NotFound {
                code: "not_found",
                message: format!("{resource} not found"),
            },
            ServiceError::IllegalState(message) => ApiError::BadRequest {
                code: "illegal_state",
                message,
            },
            ServiceError::IncorrectPassword => ApiError::BadRequest {
                code: "incorrect_password",
                message: "Current password is incorrect".to_string(),
            },
            ServiceError::Unexpected(err) => {
                let trace_id = Uuid::new_v4();
                error!(%trace_id, error = ?err, "Unexpected failure");
                ApiError::Internal { trace_id }
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
