use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use common_auth::AuthContext;
use common_http_errors::FieldError;
use serde::Deserialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::authorization::Identity;
use crate::error::{ServiceError, ServiceResult};
use crate::extract::JsonBody;
use crate::model::{RoleChangeEntry, UserAttributes, UserProfile};
use crate::users::{PasswordChange, ProfileChanges, Registration, UserSort};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub attributes: Option<UserAttributes>,
}

impl From<RegisterRequest> for Registration {
    fn from(request: RegisterRequest) -> Self {
        Self {
            email: request.email,
            password: request.password,
            username: request.username,
            first_name: request.first_name,
            last_name: request.last_name,
            attributes: request.attributes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: Option<bool>,
    pub attributes: Option<UserAttributes>,
}

impl From<UpdateUserRequest> for ProfileChanges {
    fn from(request: UpdateUserRequest) -> Self {
        Self {
            email: request.email,
            username: request.username,
            first_name: request.first_name,
            last_name: request.last_name,
            enabled: request.enabled,
            attributes: request.attributes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub old_password: Option<String>,
    pub new_password: Option<String>,
    pub confirm_password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub sort: Option<String>,
}

/// Ids that do not parse cannot name an existing user.
fn parse_user_id(raw: &str) -> ServiceResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ServiceError::UserNotFound)
}

fn required_role(request: RoleRequest) -> ServiceResult<String> {
    request
        .role
        .filter(|role| !role.trim().is_empty())
        .ok_or_else(|| ServiceError::field("role", "is required"))
}

pub async fn register_user(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> ServiceResult<(StatusCode, Json<UserProfile>)> {
    let user = state.users.register(payload.into()).await?;
    Ok((StatusCode::CREATED, Json(UserProfile::from(user))))
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListUsersQuery>,
) -> ServiceResult<Json<Vec<UserProfile>>> {
    let sort = match query.sort.as_deref() {
        None => UserSort::default(),
        Some(raw) => UserSort::parse(raw).ok_or_else(|| {
            ServiceError::Validation(vec![FieldError::new(
                "sort",
                "must be one of email, username, firstName, lastName",
            )
            .with_rejected(raw)])
        })?,
    };
    let identity = Identity::from(auth);
    let users = state.users.list(&identity, sort).await?;
    Ok(Json(users.iter().map(UserProfile::from).collect()))
}

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ServiceResult<Json<UserProfile>> {
    let id = parse_user_id(&id)?;
    let user = state.users.get(&Identity::from(auth), id).await?;
    Ok(Json(UserProfile::from(user)))
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    JsonBody(payload): JsonBody<UpdateUserRequest>,
) -> ServiceResult<Json<UserProfile>> {
    let id = parse_user_id(&id)?;
    let user = state
        .users
        .update(&Identity::from(auth), id, payload.into())
        .await?;
    Ok(Json(UserProfile::from(user)))
}

pub async fn delete_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ServiceResult<StatusCode> {
    let id = parse_user_id(&id)?;
    state.users.soft_delete(&Identity::from(auth), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    JsonBody(payload): JsonBody<ChangePasswordRequest>,
) -> ServiceResult<StatusCode> {
    let id = parse_user_id(&id)?;
    let change = PasswordChange {
        old_password: payload.old_password,
        new_password: payload.new_password,
        confirm_password: payload.confirm_password,
    };
    state
        .users
        .change_password(&Identity::from(auth), id, change)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    JsonBody(payload): JsonBody<RoleRequest>,
) -> ServiceResult<Json<UserProfile>> {
    let id = parse_user_id(&id)?;
    let role = required_role(payload)?;
    let user = state
        .users
        .add_role(&Identity::from(auth), id, &role)
        .await?;
    Ok(Json(UserProfile::from(user)))
}

pub async fn remove_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    JsonBody(payload): JsonBody<RoleRequest>,
) -> ServiceResult<Json<UserProfile>> {
    let id = parse_user_id(&id)?;
    let role = required_role(payload)?;
    let user = state
        .users
        .remove_role(&Identity::from(auth), id, &role)
        .await?;
    Ok(Json(UserProfile::from(user)))
}

pub async fn role_changes(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ServiceResult<Json<Vec<RoleChangeEntry>>> {
    let id = parse_user_id(&id)?;
    let entries = state.users.role_history(&Identity::from(auth), id).await?;
    Ok(Json(entries))
}
