use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{FromRef, State},
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware,
    response::Response,
    routing::{get, post},
    Router,
};
use common_auth::JwtVerifier;
use common_http_errors::{error_envelope, ApiError};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::AuthService;
use crate::auth_handlers;
use crate::config::AuthConfig;
use crate::error::ServiceError;
use crate::metrics::AuthMetrics;
use crate::passwords::PasswordChecker;
use crate::store::{
    InMemoryRefreshTokenStore, InMemoryRoleChangeLog, InMemoryUserStore, PgRefreshTokenStore,
    PgRoleChangeLog, PgUserStore, RefreshTokenStore, RoleChangeLog, UserStore,
};
use crate::tokens::TokenService;
use crate::user_handlers;
use crate::users::UserLifecycleService;

/// Persistence backends the services are wired against.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub role_log: Arc<dyn RoleChangeLog>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let role_log: Arc<dyn RoleChangeLog> = Arc::new(InMemoryRoleChangeLog::new());
        Self {
            users: Arc::new(InMemoryUserStore::with_role_log(role_log.clone())),
            role_log,
            refresh_tokens: Arc::new(InMemoryRefreshTokenStore::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            users: Arc::new(PgUserStore::new(pool.clone())),
            role_log: Arc::new(PgRoleChangeLog::new(pool.clone())),
            refresh_tokens: Arc::new(PgRefreshTokenStore::new(pool)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub users: Arc<UserLifecycleService>,
    pub jwt_verifier: Arc<JwtVerifier>,
    pub config: Arc<AuthConfig>,
    pub metrics: Arc<AuthMetrics>,
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_verifier.clone()
    }
}

impl AppState {
    pub fn build(
        config: AuthConfig,
        stores: Stores,
        passwords: Arc<dyn PasswordChecker>,
    ) -> Result<Self> {
        let active_key = config.active_key()?;
        info!(
            kid = active_key.kid(),
            algorithm = ?active_key.algorithm(),
            "Loaded signing key"
        );
        let metrics = Arc::new(AuthMetrics::new().context("Failed to register metrics")?);
        let tokens = Arc::new(TokenService::new(
            config.token_config(),
            active_key,
            stores.refresh_tokens.clone(),
        ));
        let auth = Arc::new(AuthService::new(
            stores.users.clone(),
            tokens.clone(),
            passwords.clone(),
            metrics.clone(),
        ));
        let users = Arc::new(UserLifecycleService::new(
            stores.users,
            stores.role_log,
            tokens.clone(),
            passwords,
            metrics.clone(),
        ));

        Ok(Self {
            auth,
            users,
            jwt_verifier: tokens.verifier(),
            config: Arc::new(config),
            metrics,
        })
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> Result<Response, ApiError> {
    state
        .metrics
        .render()
        .map_err(|err| ApiError::from(ServiceError::Unexpected(err)))
}

async fn not_found() -> ApiError {
    ApiError::NotFound {
        code: "not_found",
        message: "Resource not found".to_string(),
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    let router = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/auth/login", post(auth_handlers::login))
        .route("/auth/refresh", post(auth_handlers::refresh))
        .route("/auth/me", get(auth_handlers::me))
        .route(
            "/auth/revoke-refresh-token",
            post(auth_handlers::revoke_refresh_token),
        )
        .route(
            "/users",
            post(user_handlers::register_user).get(user_handlers::list_users),
        )
        .route(
            "/users/:id",
            get(user_handlers::get_user)
                .put(user_handlers::update_user)
                .delete(user_handlers::delete_user),
        )
        .route(
            "/users/:id/change-password",
            post(user_handlers::change_password),
        )
        .route(
            "/users/:id/roles",
            post(user_handlers::add_role).delete(user_handlers::remove_role),
        )
        .route("/users/:id/role-changes", get(user_handlers::role_changes))
        .fallback(not_found)
        .layer(middleware::from_fn(error_envelope))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([ACCEPT, CONTENT_TYPE, AUTHORIZATION])
            .allow_credentials(true),
    )
}
