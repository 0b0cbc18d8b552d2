use std::collections::HashMap;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey};
use serde_json::Value;
use tracing::debug;

use crate::claims::Claims;
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};

/// A decoding key pinned to the single algorithm it may verify.
#[derive(Clone)]
pub struct VerificationKey {
    pub key: DecodingKey,
    pub algorithm: Algorithm,
}

impl VerificationKey {
    pub fn hmac(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            algorithm: Algorithm::HS256,
        }
    }

    pub fn rsa(key: DecodingKey) -> Self {
        Self {
            key,
            algorithm: Algorithm::RS256,
        }
    }
}

/// Stateless token verification: signature, expiry, issuer, audience and required claims.
/// Keys are addressed by the `kid` header and fixed once the verifier is built.
#[derive(Clone)]
pub struct JwtVerifier {
    config: JwtConfig,
    keys: HashMap<String, VerificationKey>,
}

impl JwtVerifier {
    pub fn builder(config: JwtConfig) -> JwtVerifierBuilder {
        JwtVerifierBuilder {
            config,
            keys: HashMap::new(),
        }
    }

    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let header =
            decode_header(token).map_err(|err| AuthError::InvalidHeader(err.to_string()))?;
        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;
        if header.alg != key.algorithm {
            return Err(AuthError::Verification(format!(
                "algorithm {:?} not accepted for kid '{kid}'",
                header.alg
            )));
        }

        let validation = self.config.validation(key.algorithm);
        let token_data = decode::<Value>(token, &key.key, &validation)?;
        let claims = Claims::try_from(token_data.claims)?;
        debug!(kid, subject = %claims.subject, "verified JWT successfully");
        Ok(claims)
    }
}

pub struct JwtVerifierBuilder {
    config: JwtConfig,
    keys: HashMap<String, VerificationKey>,
}

impl JwtVerifierBuilder {
    pub fn with_key(mut self, kid: impl Into<String>, key: VerificationKey) -> Self {
        self.keys.insert(kid.into(), key);
        self
    }

    pub fn build(self) -> JwtVerifier {
        JwtVerifier {
            config: self.config,
            keys: self.keys,
        }
    }
}
