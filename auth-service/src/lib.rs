pub mod app;
pub mod auth;
pub mod auth_handlers;
pub mod authorization;
pub mod config;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod model;
pub mod password_policy;
pub mod passwords;
pub mod store;
pub mod tokens;
pub mod user_handlers;
pub mod users;

pub use app::{build_router, AppState, Stores};
pub use config::{load_auth_config, AuthConfig};
