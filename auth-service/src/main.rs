use std::sync::Arc;

use anyhow::Context;
use auth_service::passwords::Argon2Checker;
use auth_service::{build_router, load_auth_config, AppState, Stores};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_auth_config()?;
    let addr = config.socket_addr()?;

    let stores = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("Failed to connect to DATABASE_URL")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to apply migrations")?;
            info!("Using Postgres stores");
            Stores::postgres(pool)
        }
        None => {
            warn!("DATABASE_URL not set; accounts are kept in memory and lost on restart");
            Stores::in_memory()
        }
    };

    let bootstrap = config.bootstrap_admin.clone();
    let state = AppState::build(config, stores, Arc::new(Argon2Checker::new()))?;
    if let Some(admin) = bootstrap {
        let user = state
            .users
            .bootstrap_admin(&admin.email, &admin.password)
            .await
            .context("Failed to bootstrap administrator")?;
        info!(user_id = %user.id, "Bootstrap administrator ready");
    }
    let app = build_router(state);

    info!(%addr, "starting auth-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
