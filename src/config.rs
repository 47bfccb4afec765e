use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub database_url: String,
    pub pool_size: usize,
    pub max_overflow: usize,
    pub acquire_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub test_on_acquire: bool,
}

impl DbConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Upper bound on the default session lifetime, roughly ten years.
pub const MAX_SESSION_TTL_MINUTES: i64 = 10 * 366 * 24 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub ttl_minutes: i64,
    pub cleanup_batch_size: i64,
    pub cleanup_interval_secs: u64,
}

impl SessionConfig {
    /// Default session lifetime, or `None` when `ttl_minutes` is out of range.
    pub fn ttl(&self) -> Option<time::Duration> {
        if !(0..=MAX_SESSION_TTL_MINUTES).contains(&self.ttl_minutes) {
            return None;
        }
        self.ttl_minutes.checked_mul(60).map(time::Duration::seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.ttl().is_some(),
            "SESSION_TTL_MINUTES must be between 0 and {MAX_SESSION_TTL_MINUTES}"
        );
        anyhow::ensure!(
            self.cleanup_batch_size > 0,
            "SESSION_CLEANUP_BATCH must be at least 1"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
}

/// argon2id cost parameters used for new password hashes.
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub db: DbConfig,
    pub sessions: SessionConfig,
    pub tokens: TokenConfig,
    pub password: PasswordConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let db = DbConfig {
            database_url: std::env::var("DATABASE_URL")?,
            pool_size: env_or("DB_POOL_SIZE", 10),
            max_overflow: env_or("DB_MAX_OVERFLOW", 10),
            acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", 5),
            operation_timeout_secs: env_or("DB_OPERATION_TIMEOUT_SECS", 10),
            test_on_acquire: env_or("DB_TEST_ON_ACQUIRE", true),
        };
        anyhow::ensure!(db.pool_size > 0, "DB_POOL_SIZE must be at least 1");

        let sessions = SessionConfig {
            ttl_minutes: env_or("SESSION_TTL_MINUTES", 60 * 24),
            cleanup_batch_size: env_or("SESSION_CLEANUP_BATCH", 500),
            cleanup_interval_secs: env_or("SESSION_CLEANUP_INTERVAL_SECS", 300),
        };
        sessions.validate()?;

        let tokens = TokenConfig {
            secret: std::env::var("TOKEN_SECRET")?,
            issuer: std::env::var("TOKEN_ISSUER").unwrap_or_else(|_| "userstore".into()),
            audience: std::env::var("TOKEN_AUDIENCE").unwrap_or_else(|_| "userstore-sessions".into()),
        };

        let defaults = PasswordConfig::default();
        let password = PasswordConfig {
            memory_kib: env_or("PASSWORD_MEMORY_KIB", defaults.memory_kib),
            iterations: env_or("PASSWORD_ITERATIONS", defaults.iterations),
            parallelism: env_or("PASSWORD_PARALLELISM", defaults.parallelism),
        };

        Ok(Self {
            db,
            sessions,
            tokens,
            password,
        })
    }
}
