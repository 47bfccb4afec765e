use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::clock::from_millis;
use crate::error::RepoError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(RepoError::Validation(format!("unknown role `{other}`"))),
        }
    }
}

/// Optional profile attached to a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub preferences: Option<serde_json::Value>,
}

/// User record as handed to callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // argon2 PHC string, not exposed in JSON
    pub created_at: OffsetDateTime,
    pub last_login: Option<OffsetDateTime>,
    pub is_active: bool,
    pub role: Role,
    pub profile: Option<UserProfile>,
}

/// `users` LEFT JOIN `user_profiles` row.
#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: i64,
    pub last_login: Option<i64>,
    pub is_active: bool,
    pub role: String,
    pub profile_user_id: Option<i64>, // NULL when no profile row exists
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub preferences: Option<Json<serde_json::Value>>,
}

impl TryFrom<UserRow> for User {
    type Error = RepoError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = row
            .role
            .parse::<Role>()
            .map_err(|_| RepoError::Corrupt(format!("user {} has role `{}`", row.id, row.role)))?;
        let profile = row.profile_user_id.map(|_| UserProfile {
            display_name: row.display_name,
            bio: row.bio,
            avatar_url: row.avatar_url,
            preferences: row.preferences.map(|Json(v)| v),
        });
        Ok(User {
            id: row.id,
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            created_at: from_millis(row.created_at)?,
            last_login: row.last_login.map(from_millis).transpose()?,
            is_active: row.is_active,
            role,
            profile,
        })
    }
}
