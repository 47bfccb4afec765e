use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::types::Json;
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::{to_millis, Clock};
use crate::db::{bounded, track, ConnectionPool};
use crate::error::{RepoError, Result};
use crate::sessions::dto::NewSession;
use crate::sessions::repo_types::{Session, SessionRow};

// Bound parameters per metadata lookup, well under SQLite's variable limit.
const METADATA_CHUNK: usize = 500;

/// Reads and writes `user_sessions` and `session_metadata`.
#[derive(Clone)]
pub struct SessionRepository {
    pool: ConnectionPool,
    clock: Arc<dyn Clock>,
    default_ttl: time::Duration,
    cleanup_batch: i64,
    timeout: Duration,
}

impl SessionRepository {
    pub fn new(
        pool: ConnectionPool,
        clock: Arc<dyn Clock>,
        default_ttl: time::Duration,
        cleanup_batch: i64,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            clock,
            default_ttl,
            cleanup_batch: cleanup_batch.max(1),
            timeout,
        }
    }

    /// Opens a session for an active user.
    #[instrument(skip(self, new))]
    pub async fn create(&self, user_id: i64, new: NewSession) -> Result<Session> {
        let ttl = new.ttl.unwrap_or(self.default_ttl);
        if ttl.is_negative() {
            return Err(RepoError::Validation("session ttl must not be negative".into()));
        }
        let created_at = self.clock.now();
        let expires_at = created_at
            .checked_add(ttl)
            .ok_or_else(|| RepoError::Validation("session ttl too large".into()))?;
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            created_at,
            expires_at,
            ip_address: new.ip_address,
            user_agent: new.user_agent,
            metadata: new.metadata,
        };

        bounded("sessions.create", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = insert_session(&mut conn, &session).await;
            track(&mut conn, res)?;
            info!(session_id = %session.id, user_id, "session created");
            Ok(session)
        })
        .await
    }

    /// Active session by id, or `None`.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        let now = to_millis(self.clock.now());
        bounded("sessions.get", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = sqlx::query_as::<_, SessionRow>(
                r#"
                SELECT id, user_id, created_at, expires_at, ip_address, user_agent
                  FROM user_sessions
                 WHERE id = ? AND expires_at > ?
                "#,
            )
            .bind(id)
            .bind(now)
            .fetch_optional(&mut *conn)
            .await
            .map_err(RepoError::from);
            let Some(row) = track(&mut conn, res)? else {
                return Ok(None);
            };

            let res = load_metadata(&mut conn, &[row.id]).await;
            let mut metadata = track(&mut conn, res)?;
            row.into_session(metadata.remove(&id)).map(Some)
        })
        .await
    }

    /// Sessions of `user_id`, newest first. With `active_only`, sessions whose
    /// expiry is at or before the call time are left out.
    #[instrument(skip(self))]
    pub async fn list_sessions(&self, user_id: i64, active_only: bool) -> Result<Vec<Session>> {
        let now = to_millis(self.clock.now());
        bounded("sessions.list", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = if active_only {
                sqlx::query_as::<_, SessionRow>(
                    r#"
                    SELECT id, user_id, created_at, expires_at, ip_address, user_agent
                      FROM user_sessions
                     WHERE user_id = ? AND expires_at > ?
                     ORDER BY created_at DESC, id
                    "#,
                )
                .bind(user_id)
                .bind(now)
                .fetch_all(&mut *conn)
                .await
            } else {
                sqlx::query_as::<_, SessionRow>(
                    r#"
                    SELECT id, user_id, created_at, expires_at, ip_address, user_agent
                      FROM user_sessions
                     WHERE user_id = ?
                     ORDER BY created_at DESC, id
                    "#,
                )
                .bind(user_id)
                .fetch_all(&mut *conn)
                .await
            };
            let rows = track(&mut conn, res.map_err(RepoError::from))?;

            let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
            let res = load_metadata(&mut conn, &ids).await;
            let mut metadata = track(&mut conn, res)?;
            debug!(count = rows.len(), "sessions listed");

            rows.into_iter()
                .map(|row| {
                    let meta = metadata.remove(&row.id);
                    row.into_session(meta)
                })
                .collect()
        })
        .await
    }

    /// Deletes one session. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn revoke(&self, id: Uuid) -> Result<bool> {
        bounded("sessions.revoke", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = sqlx::query("DELETE FROM user_sessions WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(RepoError::from);
            let removed = track(&mut conn, res)?.rows_affected() > 0;
            if removed {
                info!(session_id = %id, "session revoked");
            }
            Ok(removed)
        })
        .await
    }

    /// Purges sessions whose expiry is strictly before the call time, in
    /// batches, and returns how many were removed.
    #[instrument(skip(self))]
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = to_millis(self.clock.now());
        let mut total = 0u64;
        loop {
            let removed = bounded("sessions.cleanup_expired", self.timeout, async {
                let mut conn = self.pool.acquire().await?;
                let res = sqlx::query(
                    r#"
                    DELETE FROM user_sessions
                     WHERE id IN (
                        SELECT id FROM user_sessions WHERE expires_at < ? LIMIT ?
                     )
                    "#,
                )
                .bind(now)
                .bind(self.cleanup_batch)
                .execute(&mut *conn)
                .await
                .map_err(RepoError::from);
                Ok(track(&mut conn, res)?.rows_affected())
            })
            .await?;

            total += removed;
            if removed < self.cleanup_batch as u64 {
                break;
            }
            debug!(removed, total, "cleanup batch done");
            tokio::task::yield_now().await;
        }
        info!(removed = total, "expired sessions cleaned up");
        Ok(total)
    }
}

async fn insert_session(conn: &mut SqliteConnection, session: &Session) -> Result<()> {
    let mut tx = conn.begin().await?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO user_sessions (id, user_id, created_at, expires_at, ip_address, user_agent)
        SELECT ?, id, ?, ?, ?, ? FROM users WHERE id = ? AND is_active = 1
        "#,
    )
    .bind(session.id)
    .bind(to_millis(session.created_at))
    .bind(to_millis(session.expires_at))
    .bind(&session.ip_address)
    .bind(&session.user_agent)
    .bind(session.user_id)
    .execute(&mut *tx)
    .await?;
    if inserted.rows_affected() == 0 {
        return Err(RepoError::NotFound);
    }

    if let Some(metadata) = &session.metadata {
        sqlx::query("INSERT INTO session_metadata (session_id, metadata) VALUES (?, ?)")
            .bind(session.id)
            .bind(Json(metadata))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Metadata for all `ids`, fetched with one `IN (...)` query per chunk.
async fn load_metadata(
    conn: &mut SqliteConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, serde_json::Value>> {
    let mut out = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(METADATA_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT session_id, metadata FROM session_metadata WHERE session_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows: Vec<(Uuid, Json<serde_json::Value>)> =
            qb.build_query_as().fetch_all(&mut *conn).await?;
        out.extend(rows.into_iter().map(|(id, Json(meta))| (id, meta)));
    }
    Ok(out)
}
