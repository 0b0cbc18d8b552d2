use axum::{
    extract::State,
    http::{
        header::{COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use common_auth::AuthContext;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::auth::Session;
use crate::authorization::Identity;
use crate::config::AuthConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::extract::JsonBody;
use crate::model::UserProfile;
use crate::tokens::TOKEN_TYPE;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

impl From<&Session> for TokenResponse {
    fn from(session: &Session) -> Self {
        Self {
            token: session.access.token.clone(),
            token_type: TOKEN_TYPE,
            expires_in: session.access.expires_in,
            expires_at: session.access.expires_at,
            user: UserProfile::from(&session.user),
        }
    }
}

pub async fn login(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> ServiceResult<Response> {
    let session = state
        .auth
        .login(payload.email.as_deref(), payload.password.as_deref())
        .await?;
    session_response(&state.config, &session)
}

pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> ServiceResult<Response> {
    let presented = read_cookie(&headers, &state.config.refresh_cookie_name);
    let session = state.auth.refresh(presented.as_deref()).await?;
    session_response(&state.config, &session)
}

pub async fn me(State(state): State<AppState>, auth: AuthContext) -> ServiceResult<Json<UserProfile>> {
    let identity = Identity::from(auth);
    let user = state.auth.current_user(&identity).await?;
    Ok(Json(UserProfile::from(user)))
}

pub async fn revoke_refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthContext,
) -> ServiceResult<Response> {
    let identity = Identity::from(auth);
    let presented = read_cookie(&headers, &state.config.refresh_cookie_name);
    state
        .auth
        .revoke_refresh_tokens(&identity, presented.as_deref())
        .await?;
    let cookie = clear_refresh_cookie(&state.config)?;
    Ok((StatusCode::NO_CONTENT, [(SET_COOKIE, cookie)]).into_response())
}

fn session_response(config: &AuthConfig, session: &Session) -> ServiceResult<Response> {
    let cookie = refresh_cookie(config, &session.refresh.token, session.refresh.expires_in)?;
    let body = TokenResponse::from(session);
    Ok(([(SET_COOKIE, cookie)], Json(body)).into_response())
}

/// `Set-Cookie` value carrying the refresh token, scoped to the refresh endpoint.
pub fn refresh_cookie(
    config: &AuthConfig,
    token: &str,
    max_age_seconds: i64,
) -> ServiceResult<HeaderValue> {
    let mut cookie = format!("{}={}; HttpOnly", config.refresh_cookie_name, token);
    if config.refresh_cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str("; SameSite=");
    cookie.push_str(config.refresh_cookie_same_site.as_str());
    cookie.push_str("; Path=");
    cookie.push_str(&config.refresh_cookie_path);
    if let Some(domain) = &config.refresh_cookie_domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    cookie.push_str(&format!("; Max-Age={}", max_age_seconds.max(0)));

    HeaderValue::from_str(&cookie)
        .map_err(|err| ServiceError::Unexpected(anyhow::anyhow!("invalid refresh cookie: {err}")))
}

pub fn clear_refresh_cookie(config: &AuthConfig) -> ServiceResult<HeaderValue> {
    refresh_cookie(config, "", 0)
}

/// First value of the named cookie across all `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
