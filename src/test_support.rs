use std::sync::Arc;

use tempfile::TempDir;
use time::macros::datetime;

use crate::clock::{Clock, ManualClock};
use crate::config::{AppConfig, SessionConfig, TokenConfig};
use crate::db::{migrate, test_support::db_config, ConnectionPool};
use crate::state::AppState;
use crate::users::password::fast_config;

/// A migrated store in a temp dir, driven by a manual clock.
pub struct TestEnv {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_cleanup_batch(500).await
    }

    pub async fn with_cleanup_batch(cleanup_batch_size: i64) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = AppConfig {
            db: db_config(&dir, 4, 4),
            sessions: SessionConfig {
                ttl_minutes: 60,
                cleanup_batch_size,
                cleanup_interval_secs: 60,
            },
            tokens: TokenConfig {
                secret: "test-secret-of-decent-length".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
            },
            password: fast_config(),
        };
        let pool = ConnectionPool::open(&config.db).await.expect("pool opens");
        migrate(&pool).await.expect("migrations apply");

        let clock = Arc::new(ManualClock::new(datetime!(2025-01-01 00:00 UTC)));
        let state = AppState::from_parts(pool, Arc::new(config), Arc::clone(&clock) as Arc<dyn Clock>)
            .expect("state builds");
        Self {
            state,
            clock,
            _dir: dir,
        }
    }
}
