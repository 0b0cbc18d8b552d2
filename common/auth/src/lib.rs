pub mod claims;
pub mod config;
pub mod error;
pub mod extractors;
pub mod roles;
pub mod verifier;

pub use claims::Claims;
pub use config::JwtConfig;
pub use error::{AuthError, AuthResult};
pub use extractors::AuthContext;
pub use roles::{normalize_role, DEFAULT_ROLES, ROLE_ADMIN, ROLE_USER};
pub use verifier::{JwtVerifier, JwtVerifierBuilder, VerificationKey};
