#![allow(dead_code)]

use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use auth_service::config::{AuthConfig, SigningKeyConfig};
use auth_service::passwords::Argon2Checker;
use auth_service::{build_router, AppState, Stores};
use axum::body::Body;
use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE},
    HeaderMap, Method, Request, StatusCode,
};
use axum::Router;
use dirs::cache_dir;
use http_body_util::BodyExt;
use pg_embed::pg_enums::PgAuthMethod;
use pg_embed::pg_fetch::{PgFetchSettings, PG_V13};
use pg_embed::postgres::{PgEmbed, PgSettings};
use portpicker::pick_unused_port;
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt;
use uuid::Uuid;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";
pub const PASSWORD: &str = "Test123!";

pub fn test_config() -> AuthConfig {
    AuthConfig::new(SigningKeyConfig::Hmac(TEST_SECRET.to_string()))
}

/// The full router over in-memory stores with cheap argon2 parameters.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn error_code(&self) -> Option<&str> {
        self.headers
            .get("x-error-code")
            .and_then(|value| value.to_str().ok())
    }

    pub fn set_cookie(&self) -> Option<String> {
        self.headers
            .get(SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// `name=value` pair of the Set-Cookie header, ready to send back.
    pub fn cookie_pair(&self) -> Option<String> {
        self.set_cookie()
            .and_then(|cookie| cookie.split(';').next().map(|pair| pair.trim().to_string()))
    }
}

pub struct LoggedIn {
    pub user_id: Uuid,
    pub token: String,
    pub cookie: String,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_stores(Stores::in_memory())
    }

    pub fn with_stores(stores: Stores) -> Self {
        let passwords = Arc::new(Argon2Checker::with_params(8, 1, 1).expect("argon2 params"));
        let state = AppState::build(test_config(), stores, passwords).expect("app state");
        let router = build_router(state.clone());
        Self { router, state }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("response body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        self.send(request).await
    }

    pub async fn refresh_with(&self, cookie: Option<&str>) -> TestResponse {
        let mut builder = Request::builder().method(Method::POST).uri("/auth/refresh");
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        self.send(builder.body(Body::empty()).expect("request")).await
    }

    pub async fn register(&self, email: &str) -> Value {
        let response = self
            .call(
                Method::POST,
                "/users",
                None,
                Some(json!({ "email": email, "password": PASSWORD })),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.body
    }

    pub async fn login(&self, email: &str, password: &str) -> LoggedIn {
        let response = self
            .call(
                Method::POST,
                "/auth/login",
                None,
                Some(json!({ "email": email, "password": password })),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "{}", response.body);
        LoggedIn {
            user_id: response.body["user"]["id"]
                .as_str()
                .and_then(|id| Uuid::parse_str(id).ok())
                .expect("user id"),
            token: response.body["token"]
                .as_str()
                .expect("access token")
                .to_string(),
            cookie: response.cookie_pair().expect("refresh cookie"),
        }
    }

    pub async fn register_and_login(&self, email: &str) -> LoggedIn {
        self.register(email).await;
        self.login(email, PASSWORD).await
    }

    pub async fn admin(&self, email: &str) -> LoggedIn {
        self.state
            .users
            .bootstrap_admin(email, PASSWORD)
            .await
            .expect("bootstrap admin");
        self.login(email, PASSWORD).await
    }
}

pub struct TestDatabase {
    pool: PgPool,
    embedded: Option<EmbeddedPg>,
}

impl TestDatabase {
    pub async fn setup() -> Result<Option<Self>> {
        if env::var("AUTH_TEST_DATABASE_URL").is_err() && !env_flag_enabled("AUTH_TEST_USE_EMBED") {
            eprintln!(
                "Skipping auth-service integration tests: set AUTH_TEST_DATABASE_URL or AUTH_TEST_USE_EMBED=1 to run them.",
            );
            return Ok(None);
        }

        let mut embedded = None;
        let database_url = if let Ok(url) = env::var("AUTH_TEST_DATABASE_URL") {
            url
        } else {
            if env_flag_enabled("AUTH_TEST_EMBED_CLEAR_CACHE") {
                if let Some(cache_dir) = cache_dir() {
                    let _ = std::fs::remove_dir_all(cache_dir.join("pg-embed"));
                }
            }

            let temp = tempdir()?;
            let port = pick_unused_port()
                .context("failed to find available port for embedded Postgres")?;

            let mut fetch_settings = PgFetchSettings::default();
            fetch_settings.version = PG_V13;

            let mut pg = PgEmbed::new(
                PgSettings {
                    database_dir: temp.path().to_path_buf(),
                    port,
                    user: "postgres".to_string(),
                    password: "postgres".to_string(),
                    auth_method: PgAuthMethod::Plain,
                    persistent: false,
                    timeout: Some(Duration::from_secs(30)),
                    migration_dir: None,
                },
                fetch_settings,
            )
            .await?;

            pg.setup().await?;
            pg.start_db().await?;

            let uri = format!("{}/postgres", pg.db_uri);
            embedded = Some(EmbeddedPg {
                pg,
                _temp_dir: temp,
            });
            uri
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        if embedded.is_some() || env_flag_enabled("AUTH_TEST_APPLY_MIGRATIONS") {
            run_migrations(&pool).await?;
        }

        Ok(Some(Self { pool, embedded }))
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub async fn teardown(self) -> Result<()> {
        if let Some(embedded) = self.embedded {
            embedded.shutdown().await;
        }
        Ok(())
    }
}

struct EmbeddedPg {
    pg: PgEmbed,
    _temp_dir: TempDir,
}

impl EmbeddedPg {
    async fn shutdown(mut self) {
        let _ = self.pg.stop_db().await;
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrations_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let mut entries = std::fs::read_dir(&migrations_dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for path in entries {
        let sql = std::fs::read_to_string(&path)?;
        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed).execute(pool).await?;
        }
    }

    Ok(())
}

fn env_flag_enabled(key: &str) -> bool {
    matches!(env::var(key), Ok(value) if is_truthy(value.as_str()))
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}
