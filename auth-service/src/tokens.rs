use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use common_auth::{Claims, JwtConfig, JwtVerifier, VerificationKey};
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use rand_core::{OsRng, RngCore};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::store::{RefreshTokenRecord, RefreshTokenStore};

pub const MIN_HMAC_SECRET_BYTES: usize = 32;
pub const TOKEN_TYPE: &str = "Bearer";

pub const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
pub const DEFAULT_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Claims binding shared with the verifier, plus the lifetimes of issued tokens.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub jwt: JwtConfig,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

impl TokenConfig {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            jwt: JwtConfig::new(issuer, audience),
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
        }
    }
}

/// The process-wide signing key and its verification counterpart.
pub struct ActiveKey {
    kid: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    verification: VerificationKey,
}

impl ActiveKey {
    pub fn hmac(kid: impl Into<String>, secret: &[u8]) -> Result<Self> {
        if secret.len() < MIN_HMAC_SECRET_BYTES {
            return Err(anyhow!(
                "HMAC signing secret must be at least {MIN_HMAC_SECRET_BYTES} bytes"
            ));
        }
        Ok(Self {
            kid: kid.into(),
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(secret),
            verification: VerificationKey::hmac(secret),
        })
    }

    /// RS256 from a PKCS#8 or PKCS#1 private key; the public half is derived from it.
    pub fn rsa_pem(kid: impl Into<String>, pem: &str) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|err| anyhow!("Failed to parse RSA signing key: {err}"))?;
        let (n, e) = components_from_private_pem(pem)?;
        let decoding_key = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|err| anyhow!("Failed to derive RSA verification key: {err}"))?;
        Ok(Self {
            kid: kid.into(),
            algorithm: Algorithm::RS256,
            encoding_key,
            verification: VerificationKey::rsa(decoding_key),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

fn components_from_private_pem(pem: &str) -> Result<(String, String)> {
    let private = RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|err| anyhow!("Failed to parse RSA private key: {err}"))?;
    let public = private.to_public_key();
    let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
    Ok((n, e))
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token: String,
    pub token_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

#[derive(Serialize)]
struct AccessClaims<'a> {
    sub: String,
    email: &'a str,
    roles: &'a [String],
    iss: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
    jti: String,
}

/// Issues signed access tokens and opaque rotating refresh tokens, and validates both.
pub struct TokenService {
    config: TokenConfig,
    active_key: ActiveKey,
    verifier: Arc<JwtVerifier>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
}

impl TokenService {
    pub fn new(
        config: TokenConfig,
        active_key: ActiveKey,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        let verifier = JwtVerifier::builder(config.jwt.clone())
            .with_key(active_key.kid.clone(), active_key.verification.clone())
            .build();
        Self {
            config,
            active_key,
            verifier: Arc::new(verifier),
            refresh_tokens,
        }
    }

    /// Verifier sharing this service's key, for the bearer extractor.
    pub fn verifier(&self) -> Arc<JwtVerifier> {
        self.verifier.clone()
    }

    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        email: &str,
        roles: &[String],
    ) -> ServiceResult<AccessToken> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.access_ttl_seconds);
        let claims = AccessClaims {
            sub: user_id.to_string(),
            email,
            roles,
            iss: &self.config.jwt.issuer,
            aud: &self.config.jwt.audience,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(self.active_key.algorithm);
        header.kid = Some(self.active_key.kid.clone());

        let token = encode(&header, &claims, &self.active_key.encoding_key)
            .map_err(|err| anyhow!("Failed to sign access token: {err}"))?;

        Ok(AccessToken {
            token,
            expires_at,
            expires_in: self.config.access_ttl_seconds,
        })
    }

    pub async fn issue_refresh_token(&self, user_id: Uuid) -> ServiceResult<RefreshToken> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.refresh_ttl_seconds);
        let (token_id, token) = generate_refresh_token();

        self.refresh_tokens
            .insert(RefreshTokenRecord {
                token_id,
                user_id,
                token_hash: hash_refresh_token(&token),
                issued_at: now,
                expires_at,
            })
            .await?;

        Ok(RefreshToken {
            token,
            token_id,
            expires_at,
            expires_in: self.config.refresh_ttl_seconds,
        })
    }

    /// Signature, structure, expiry and required claims; any failure is `InvalidToken`.
    pub fn parse_and_validate(&self, token: &str) -> ServiceResult<Claims> {
        self.verifier.verify(token).map_err(|err| {
            debug!(reason = %err, "Access token rejected");
            ServiceError::InvalidToken
        })
    }

    /// Spends a refresh token. Unknown, already used and expired tokens all fail with
    /// `InvalidToken`; the token is gone from the store afterwards in every case.
    pub async fn consume_refresh_token(&self, token: &str) -> ServiceResult<RefreshTokenRecord> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ServiceError::InvalidToken);
        }
        let record = self
            .refresh_tokens
            .consume(&hash_refresh_token(token))
            .await?
            .ok_or(ServiceError::InvalidToken)?;
        if record.expires_at <= Utc::now() {
            debug!(token_id = %record.token_id, "Expired refresh token presented");
            return Err(ServiceError::InvalidToken);
        }
        Ok(record)
    }

    /// Drops one refresh token, provided it belongs to `user_id`. Returns whether a token
    /// was removed.
    pub async fn revoke_refresh_token(&self, user_id: Uuid, token: &str) -> ServiceResult<bool> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(false);
        }
        Ok(self
            .refresh_tokens
            .revoke(&hash_refresh_token(token), user_id)
            .await?)
    }

    pub async fn revoke_all_for(&self, user_id: Uuid) -> ServiceResult<u64> {
        Ok(self.refresh_tokens.revoke_all_for_user(user_id).await?)
    }
}

fn generate_refresh_token() -> (Uuid, String) {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let token_id = Uuid::new_v4();
    let random = URL_SAFE_NO_PAD.encode(bytes);
    (token_id, format!("{token_id}.{random}"))
}

fn hash_refresh_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
