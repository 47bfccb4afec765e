use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::from_millis;
use crate::error::RepoError;

/// Login session as handed to callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub user_id: i64,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub ip_address: String,
    pub user_agent: String,
    pub metadata: Option<serde_json::Value>,
}

impl Session {
    /// Active iff the expiry is strictly later than `now`.
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at > now
    }
}

/// `user_sessions` row.
#[derive(Debug, FromRow)]
pub(crate) struct SessionRow {
    pub id: Uuid,
    pub user_id: i64,
    pub created_at: i64,
    pub expires_at: i64,
    pub ip_address: String,
    pub user_agent: String,
}

impl SessionRow {
    pub fn into_session(self, metadata: Option<serde_json::Value>) -> Result<Session, RepoError> {
        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            created_at: from_millis(self.created_at)?,
            expires_at: from_millis(self.expires_at)?,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            metadata,
        })
    }
}
