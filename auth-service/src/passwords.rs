use std::sync::Arc;

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand_core::OsRng;

/// Hashing and constant-time verification of stored credentials.
pub trait PasswordChecker: Send + Sync {
    fn hash(&self, plain: &str) -> Result<String>;

    /// `false` for a mismatch and for a stored value that is not a parseable hash.
    fn verify(&self, plain: &str, stored_hash: &str) -> bool;

    /// Spends roughly one verification worth of work when no account matched, so
    /// unknown emails are not distinguishable by response time.
    fn verify_absent(&self, plain: &str) {
        let _ = self.hash(plain);
    }
}

/// Runs `work` against the checker on the blocking pool; argon2 is too slow for a runtime worker.
async fn off_runtime<T, F>(checker: &Arc<dyn PasswordChecker>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn PasswordChecker) -> T + Send + 'static,
{
    let checker = Arc::clone(checker);
    tokio::task::spawn_blocking(move || work(checker.as_ref()))
        .await
        .map_err(|err| anyhow!("Password worker failed: {err}"))
}

pub async fn hash_password(checker: &Arc<dyn PasswordChecker>, plain: &str) -> Result<String> {
    let plain = plain.to_owned();
    off_runtime(checker, move |checker| checker.hash(&plain)).await?
}

pub async fn verify_password(
    checker: &Arc<dyn PasswordChecker>,
    plain: &str,
    stored_hash: &str,
) -> Result<bool> {
    let plain = plain.to_owned();
    let stored_hash = stored_hash.to_owned();
    off_runtime(checker, move |checker| checker.verify(&plain, &stored_hash)).await
}

pub async fn verify_absent_password(checker: &Arc<dyn PasswordChecker>, plain: &str) -> Result<()> {
    let plain = plain.to_owned();
    off_runtime(checker, move |checker| checker.verify_absent(&plain)).await
}

#[derive(Clone)]
pub struct Argon2Checker {
    argon2: Argon2<'static>,
}

impl Argon2Checker {
    pub fn new() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }

    /// Custom cost parameters (memory KiB, iterations, parallelism).
    pub fn with_params(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|err| anyhow!("Invalid argon2 parameters: {err}"))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }
}

impl Default for Argon2Checker {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordChecker for Argon2Checker {
    fn hash(&self, plain: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(plain.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| anyhow!("Failed to hash password: {err}"))
    }

    fn verify(&self, plain: &str, stored_hash: &str) -> bool {
        match PasswordHash::new(stored_hash) {
            Ok(parsed) => self
                .argon2
                .verify_password(plain.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}
