use jsonwebtoken::{Algorithm, Validation};

/// Registered claims an access token must carry to be accepted.
pub const REQUIRED_CLAIMS: &[&str] = &["exp", "sub", "iss", "aud"];

pub const DEFAULT_LEEWAY_SECONDS: u32 = 30;

/// What an access token is bound to: the issuing service, the intended audience and the
/// clock skew tolerated on `exp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    pub leeway_seconds: u32,
}

impl JwtConfig {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_seconds: DEFAULT_LEEWAY_SECONDS,
        }
    }

    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }

    /// Validation rules for a token signed with `algorithm`. Only that algorithm is
    /// accepted, so a key can never be used to check a token of another family.
    pub fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(REQUIRED_CLAIMS);
        validation.leeway = self.leeway_seconds.into();
        validation
    }
}
