use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct AuthMetrics {
    registry: Registry,
    login_attempts: IntCounterVec,
    token_refreshes: IntCounterVec,
    role_changes: IntCounterVec,
}

impl AuthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let login_attempts = IntCounterVec::new(
            Opts::new(
                "auth_login_attempts_total",
                "Count of login attempts grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(login_attempts.clone()))?;

        let token_refreshes = IntCounterVec::new(
            Opts::new(
                "auth_token_refresh_total",
                "Count of refresh token exchanges grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(token_refreshes.clone()))?;

        let role_changes = IntCounterVec::new(
            Opts::new("auth_role_changes_total", "Count of applied role changes"),
            &["action"],
        )?;
        registry.register(Box::new(role_changes.clone()))?;

        common_http_errors::register_error_metrics(&registry)?;

        Ok(Self {
            registry,
            login_attempts,
            token_refreshes,
            role_changes,
        })
    }

    pub fn login_attempt(&self, outcome: &str) {
        self.login_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn token_refresh(&self, outcome: &str) {
        self.token_refreshes.with_label_values(&[outcome]).inc();
    }

    pub fn role_change(&self, action: &str) {
        self.role_changes.with_label_values(&[action]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
