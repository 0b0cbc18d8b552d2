use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::{middleware, routing::get, Router};
use common_http_errors::{error_envelope, ApiError, FieldError};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

#[test]
fn validation_variant() {
    let err = ApiError::validation(vec![FieldError::new("password", "is required")]);
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "validation_failed");
}

#[test]
fn unauthorized_variant() {
    let err = ApiError::Unauthorized { code: "invalid_credentials", message: "Invalid email or password".into() };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_credentials");
}

#[test]
fn forbidden_variant() {
    let err = ApiError::Forbidden { code: "forbidden", message: "nope".into() };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "forbidden");
}

#[test]
fn conflict_variant() {
    let err = ApiError::Conflict { code: "duplicate_identity", message: "taken".into() };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "duplicate_identity");
}

#[test]
fn not_found_variant() {
    let err = ApiError::NotFound { code: "user_not_found", message: "missing".into() };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "user_not_found");
}

#[test]
fn unsupported_media_type_variant() {
    let err = ApiError::UnsupportedMediaType { message: "json only".into() };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "unsupported_media_type");
}

#[test]
fn internal_variant() {
    let err = ApiError::Internal { trace_id: Uuid::new_v4() };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "internal_error");
}

async fn conflict() -> Result<&'static str, ApiError> {
    Err(ApiError::Conflict { code: "duplicate_identity", message: "Email already in use".into() })
}

#[tokio::test]
async fn envelope_middleware_stamps_request_path() {
    let app = Router::new()
        .route("/users", get(conflict))
        .layer(middleware::from_fn(error_envelope));

    let resp = app
        .oneshot(Request::builder().uri("/users").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], 409);
    assert_eq!(body["error"], "Conflict");
    assert_eq!(body["message"], "Email already in use");
    assert_eq!(body["path"], "/users");
    assert!(body["timestamp"].is_string());
    assert!(body.get("errors").is_none());
}

#[tokio::test]
async fn envelope_middleware_leaves_success_untouched() {
    let app = Router::new()
        .route("/ok", get(|| async { "fine" }))
        .layer(middleware::from_fn(error_envelope));

    let resp = app
        .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"fine");
}
