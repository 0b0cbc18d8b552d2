//! Uniform error envelope shared by every HTTP surface in the workspace.
//!
//! Handlers return [`ApiError`]; the [`error_envelope`] middleware stamps the request path
//! into the body and counts the response in `http_errors_total`.

use axum::{
    body::Body,
    extract::Request,
    http::{header::CONTENT_LENGTH, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const ERROR_CODE_HEADER: &str = "X-Error-Code";

const INTERNAL_MESSAGE: &str = "An unexpected error occurred";

static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "http_errors_total",
            "Count of HTTP error responses emitted (status >= 400)",
        ),
        &["status", "code"],
    )
    .expect("static http_errors_total definition")
});

/// Registers the shared error counter with a service registry.
pub fn register_error_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(HTTP_ERRORS_TOTAL.clone()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub rejected_value: Option<serde_json::Value>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            rejected_value: None,
        }
    }

    pub fn with_rejected(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.rejected_value = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub timestamp: DateTime<Utc>,
    pub status: u16,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
}

#[derive(Debug)]
pub enum ApiError {
    Validation { message: String, errors: Vec<FieldError> },
    BadRequest { code: &'static str, message: String },
    Unauthorized { code: &'static str, message: String },
    Forbidden { code: &'static str, message: String },
    NotFound { code: &'static str, message: String },
    Conflict { code: &'static str, message: String },
    UnsupportedMediaType { message: String },
    /// Details stay in the server log; the client only sees the correlation id.
    Internal { trace_id: Uuid },
}

impl ApiError {
    pub fn validation(errors: Vec<FieldError>) -> Self {
        Self::Validation {
            message: "Validation failed for one or more fields".to_string(),
            errors,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } | ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "validation_failed",
            ApiError::BadRequest { code, .. }
            | ApiError::Unauthorized { code, .. }
            | ApiError::Forbidden { code, .. }
            | ApiError::NotFound { code, .. }
            | ApiError::Conflict { code, .. } => code,
            ApiError::UnsupportedMediaType { .. } => "unsupported_media_type",
            ApiError::Internal { .. } => "internal_error",
        }
    }

    pub fn into_body(self) -> ErrorResponse {
        let status = self.status();
        let (message, errors) = match self {
            ApiError::Validation { message, errors } => (message, Some(errors)),
            ApiError::BadRequest { message, .. }
            | ApiError::Unauthorized { message, .. }
            | ApiError::Forbidden { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::UnsupportedMediaType { message } => (message, None),
            ApiError::Internal { trace_id } => {
                (format!("{INTERNAL_MESSAGE} (reference {trace_id})"), None)
            }
        };
        ErrorResponse {
            timestamp: Utc::now(),
            status: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message,
            path: None,
            errors,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = self.into_body();
        let mut resp = (status, Json(body.clone())).into_response();
        resp.headers_mut()
            .insert(ERROR_CODE_HEADER, HeaderValue::from_static(code));
        resp.extensions_mut().insert(body);
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Middleware: re-renders error bodies with the request path and counts them.
pub async fn error_envelope(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    let response = next.run(request).await;

    let status = response.status();
    if status.as_u16() < 400 {
        return response;
    }
    let code = response
        .headers()
        .get(ERROR_CODE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unclassified")
        .to_owned();
    HTTP_ERRORS_TOTAL
        .with_label_values(&[status.as_str(), code.as_str()])
        .inc();

    let Some(mut body) = response.extensions().get::<ErrorResponse>().cloned() else {
        return response;
    };
    body.path = Some(path);

    let (mut parts, original) = response.into_parts();
    match serde_json::to_vec(&body) {
        Ok(bytes) => {
            parts.headers.remove(CONTENT_LENGTH);
            parts.extensions.insert(body);
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(err) => {
            warn!(error = %err, "Failed to re-render error body");
            Response::from_parts(parts, original)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_body_hides_details_but_carries_reference() {
        let trace = Uuid::new_v4();
        let body = ApiError::Internal { trace_id: trace }.into_body();
        assert_eq!(body.status, 500);
        assert_eq!(body.error, "Internal Server Error");
        assert!(body.message.contains(&trace.to_string()));
        assert!(body.errors.is_none());
    }

    #[test]
    fn validation_body_lists_every_field() {
        let body = ApiError::validation(vec![
            FieldError::new("password", "must contain at least one digit"),
            FieldError::new("email", "must be a well-formed email address")
                .with_rejected("nope"),
        ])
        .into_body();
        let errors = body.errors.expect("field errors");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].rejected_value, Some(serde_json::json!("nope")));
    }
}
