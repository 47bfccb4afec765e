use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::error;

use crate::config::PasswordConfig;
use crate::error::RepoError;

/// argon2id hasher with fixed cost parameters.
///
/// Keeps a hash of a throwaway secret made with the same parameters so that
/// checking a password for an unknown account costs the same as for a real one.
#[derive(Clone)]
pub struct Credentials {
    argon2: Argon2<'static>,
    dummy_hash: String,
}

impl Credentials {
    pub fn new(config: &PasswordConfig) -> Result<Self, RepoError> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            None,
        )
        .map_err(|e| RepoError::Credential(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let dummy_hash = hash_with(&argon2, "userstore-timing-equalizer")?;
        Ok(Self { argon2, dummy_hash })
    }

    pub fn hash(&self, plain: &str) -> Result<String, RepoError> {
        hash_with(&self.argon2, plain)
    }

    /// Checks `plain` against `hash`, or against the dummy hash when there is
    /// no stored hash. The latter always yields `false`.
    pub fn verify(&self, plain: &str, hash: Option<&str>) -> Result<bool, RepoError> {
        let target = hash.unwrap_or(&self.dummy_hash);
        let parsed = PasswordHash::new(target).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            RepoError::Credential(e.to_string())
        })?;
        let matched = self
            .argon2
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok();
        Ok(matched && hash.is_some())
    }

    /// Runs [`Credentials::hash`] off the async executor.
    pub async fn hash_blocking(&self, plain: String) -> Result<String, RepoError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.hash(&plain))
            .await
            .map_err(|e| RepoError::Credential(e.to_string()))?
    }

    /// Runs [`Credentials::verify`] off the async executor.
    pub async fn verify_blocking(
        &self,
        plain: String,
        hash: Option<String>,
    ) -> Result<bool, RepoError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.verify(&plain, hash.as_deref()))
            .await
            .map_err(|e| RepoError::Credential(e.to_string()))?
    }
}

fn hash_with(argon2: &Argon2<'_>, plain: &str) -> Result<String, RepoError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            RepoError::Credential(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

#[cfg(test)]
pub(crate) fn fast_config() -> PasswordConfig {
    PasswordConfig {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}
