use std::sync::Arc;

use anyhow::Context;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db::{self, ConnectionPool};
use crate::error::RepoError;
use crate::sessions::{SessionRepository, SessionTokens};
use crate::users::{Credentials, UserRepository};

/// Everything a caller needs, wired around one shared pool.
#[derive(Clone)]
pub struct AppState {
    pub pool: ConnectionPool,
    pub config: Arc<AppConfig>,
    pub clock: Arc<dyn Clock>,
    pub users: UserRepository,
    pub sessions: SessionRepository,
    pub tokens: SessionTokens,
}

impl AppState {
    /// Opens the pool, applies migrations and builds the repositories.
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let pool = ConnectionPool::open(&config.db)
            .await
            .context("open connection pool")?;
        db::migrate(&pool).await.context("apply migrations")?;
        let state = Self::from_parts(pool, Arc::new(config), Arc::new(SystemClock))
            .context("build repositories")?;
        Ok(state)
    }

    pub fn from_parts(
        pool: ConnectionPool,
        config: Arc<AppConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RepoError> {
        let timeout = config.db.operation_timeout();
        let credentials = Credentials::new(&config.password)?;
        let tokens = SessionTokens::new(&config.tokens)?;
        let session_ttl = config
            .sessions
            .ttl()
            .ok_or_else(|| RepoError::Validation("session ttl out of range".into()))?;
        let users = UserRepository::new(pool.clone(), Arc::clone(&clock), credentials, timeout);
        let sessions = SessionRepository::new(
            pool.clone(),
            Arc::clone(&clock),
            session_ttl,
            config.sessions.cleanup_batch_size,
            timeout,
        );
        Ok(Self {
            pool,
            config,
            clock,
            users,
            sessions,
            tokens,
        })
    }

    /// Closes the pool. Repositories fail with `PoolError::Closed` afterwards.
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, TokenConfig};
    use crate::db::test_support::db_config;
    use crate::users::password::fast_config;

    #[tokio::test]
    async fn out_of_range_session_ttl_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            db: db_config(&dir, 1, 0),
            sessions: SessionConfig {
                ttl_minutes: i64::MAX,
                cleanup_batch_size: 10,
                cleanup_interval_secs: 60,
            },
            tokens: TokenConfig {
                secret: "test-secret-of-decent-length".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
            },
            password: fast_config(),
        };
        let pool = ConnectionPool::open(&config.db).await.unwrap();
        let built = AppState::from_parts(pool, Arc::new(config), Arc::new(SystemClock));
        assert!(matches!(built, Err(RepoError::Validation(_))));
    }
}
