use std::sync::Arc;
use std::time::Duration;

use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use crate::clock::{to_millis, Clock};
use crate::db::{bounded, track, ConnectionPool};
use crate::error::{RepoError, Result};
use crate::users::dto::{NewUser, ProfileUpdate};
use crate::users::password::Credentials;
use crate::users::repo_types::{User, UserRow};
use crate::users::services::{
    contains_pattern, fold_case, is_valid_email, normalize_email, validate_email, validate_limit,
    validate_password, validate_username,
};

/// Reads and writes `users` and `user_profiles`.
#[derive(Clone)]
pub struct UserRepository {
    pool: ConnectionPool,
    clock: Arc<dyn Clock>,
    credentials: Credentials,
    timeout: Duration,
}

impl UserRepository {
    pub fn new(
        pool: ConnectionPool,
        clock: Arc<dyn Clock>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            clock,
            credentials,
            timeout,
        }
    }

    /// Active user with profile, or `None`. Records the access time.
    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        bounded("users.get_by_id", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = find_active_by_id(&mut conn, id).await;
            let Some(user) = track(&mut conn, res)? else {
                return Ok(None);
            };

            let touched = sqlx::query("UPDATE users SET last_accessed = ? WHERE id = ?")
                .bind(to_millis(self.clock.now()))
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(RepoError::from);
            if let Err(e) = track(&mut conn, touched) {
                warn!(user_id = id, error = %e, "failed to record last access");
            }
            Ok(Some(user))
        })
        .await
    }

    /// Active user with the given email, or `None`.
    #[instrument(skip(self, email))]
    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        bounded("users.get_by_email", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = find_active_by_email(&mut conn, &email).await;
            track(&mut conn, res)
        })
        .await
    }

    /// Creates an active user. A taken email is reported as [`RepoError::Conflict`].
    #[instrument(skip(self, new), fields(username = %new.username, role = %new.role))]
    pub async fn create(&self, new: NewUser) -> Result<User> {
        let NewUser {
            username,
            email,
            password,
            role,
        } = new;
        let username = username.trim().to_string();
        let email = normalize_email(&email);
        validate_username(&username)?;
        validate_email(&email)?;
        validate_password(&password)?;

        bounded("users.create", self.timeout, async {
            let password_hash = self.credentials.hash_blocking(password).await?;
            let created_at = to_millis(self.clock.now());

            let mut conn = self.pool.acquire().await?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO users
                    (username, username_folded, email, password_hash, created_at, is_active, role)
                VALUES (?, ?, ?, ?, ?, 1, ?)
                "#,
            )
            .bind(&username)
            .bind(fold_case(&username))
            .bind(&email)
            .bind(&password_hash)
            .bind(created_at)
            .bind(role.as_str())
            .execute(&mut *conn)
            .await
            .map_err(RepoError::from);

            let id = match track(&mut conn, inserted) {
                Ok(done) => done.last_insert_rowid(),
                Err(RepoError::Conflict(_)) => {
                    warn!("email already registered");
                    return Err(RepoError::Conflict("email already registered".into()));
                }
                Err(e) => return Err(e),
            };

            let res = find_active_by_id(&mut conn, id).await;
            let user = track(&mut conn, res)?.ok_or(RepoError::NotFound)?;
            info!(user_id = user.id, "user created");
            Ok(user)
        })
        .await
    }

    /// Returns the user when `password` matches.
    ///
    /// Unknown emails still pay for one argon2 verification against a dummy
    /// hash, so the two failure paths are indistinguishable by timing.
    #[instrument(skip(self, email, password))]
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        bounded("users.authenticate", self.timeout, async {
            let found = if is_valid_email(&email) {
                let mut conn = self.pool.acquire().await?;
                let res = find_active_by_email(&mut conn, &email).await;
                track(&mut conn, res)?
            } else {
                None
            };

            let stored = found.as_ref().map(|u| u.password_hash.clone());
            let matched = self
                .credentials
                .verify_blocking(password.to_owned(), stored)
                .await?;

            let mut user = match (matched, found) {
                (true, Some(user)) => user,
                (_, found) => {
                    warn!(known_account = found.is_some(), "authentication failed");
                    return Ok(None);
                }
            };

            let now = self.clock.now();
            let mut conn = self.pool.acquire().await?;
            let updated = sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
                .bind(to_millis(now))
                .bind(user.id)
                .execute(&mut *conn)
                .await
                .map_err(RepoError::from);
            match track(&mut conn, updated) {
                Ok(_) => user.last_login = Some(now),
                Err(e) => warn!(user_id = user.id, error = %e, "failed to record last login"),
            }
            info!(user_id = user.id, "user authenticated");
            Ok(Some(user))
        })
        .await
    }

    /// Case-insensitive substring search over username, email and display
    /// name, most recent login first.
    #[instrument(skip(self, term))]
    pub async fn search(&self, term: &str, limit: i64) -> Result<Vec<User>> {
        let term = term.trim();
        if term.is_empty() {
            return Err(RepoError::Validation("search term must not be empty".into()));
        }
        validate_limit(limit)?;
        let pattern = contains_pattern(term);

        bounded("users.search", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = sqlx::query_as::<_, UserRow>(
                r#"
                SELECT u.id, u.username, u.email, u.password_hash, u.created_at, u.last_login,
                       u.is_active, u.role, p.user_id AS profile_user_id, p.display_name,
                       p.bio, p.avatar_url, p.preferences
                  FROM users u
                  LEFT JOIN user_profiles p ON p.user_id = u.id
                 WHERE u.is_active = 1
                   AND (u.username_folded LIKE ? ESCAPE '\'
                        OR u.email LIKE ? ESCAPE '\'
                        OR COALESCE(p.display_name_folded, '') LIKE ? ESCAPE '\')
                 ORDER BY u.last_login IS NULL, u.last_login DESC, u.id ASC
                 LIMIT ?
                "#,
            )
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await
            .map_err(RepoError::from);
            let rows = track(&mut conn, res)?;
            rows.into_iter().map(User::try_from).collect()
        })
        .await
    }

    /// Creates or replaces the profile of an active user.
    #[instrument(skip(self, update))]
    pub async fn upsert_profile(&self, id: i64, update: ProfileUpdate) -> Result<User> {
        bounded("users.upsert_profile", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = sqlx::query(
                r#"
                INSERT INTO user_profiles
                    (user_id, display_name, display_name_folded, bio, avatar_url, preferences)
                SELECT id, ?, ?, ?, ?, ? FROM users WHERE id = ? AND is_active = 1
                ON CONFLICT (user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    display_name_folded = excluded.display_name_folded,
                    bio = excluded.bio,
                    avatar_url = excluded.avatar_url,
                    preferences = excluded.preferences
                "#,
            )
            .bind(update.display_name.as_deref().map(fold_case))
            .bind(update.display_name)
            .bind(update.bio)
            .bind(update.avatar_url)
            .bind(update.preferences.map(Json))
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(RepoError::from);
            if track(&mut conn, res)?.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }

            let res = find_active_by_id(&mut conn, id).await;
            track(&mut conn, res)?.ok_or(RepoError::NotFound)
        })
        .await
    }

    /// Clears the active flag. Returns `false` if the user was already
    /// inactive or does not exist.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, id: i64) -> Result<bool> {
        bounded("users.deactivate", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let res = sqlx::query("UPDATE users SET is_active = 0 WHERE id = ? AND is_active = 1")
                .bind(id)
                .execute(&mut *conn)
                .await
                .map_err(RepoError::from);
            let changed = track(&mut conn, res)?.rows_affected() > 0;
            if changed {
                info!(user_id = id, "user deactivated");
            }
            Ok(changed)
        })
        .await
    }
}

async fn find_active_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT u.id, u.username, u.email, u.password_hash, u.created_at, u.last_login,
               u.is_active, u.role, p.user_id AS profile_user_id, p.display_name,
               p.bio, p.avatar_url, p.preferences
          FROM users u
          LEFT JOIN user_profiles p ON p.user_id = u.id
         WHERE u.id = ? AND u.is_active = 1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;
    row.map(User::try_from).transpose()
}

async fn find_active_by_email(conn: &mut SqliteConnection, email: &str) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT u.id, u.username, u.email, u.password_hash, u.created_at, u.last_login,
               u.is_active, u.role, p.user_id AS profile_user_id, p.display_name,
               p.bio, p.avatar_url, p.preferences
          FROM users u
          LEFT JOIN user_profiles p ON p.user_id = u.id
         WHERE u.email = ? AND u.is_active = 1
        "#,
    )
    .bind(email)
    .fetch_optional(conn)
    .await?;
    row.map(User::try_from).transpose()
}
