use std::time::Duration;

use thiserror::Error;

/// Failures while handing out connections.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Every connection is checked out and none came back in time.
    #[error("connection pool exhausted after waiting {waited:?}")]
    Exhausted { waited: Duration },

    #[error("failed to open a store connection")]
    Connect(#[source] sqlx::Error),

    #[error("connection pool is closed")]
    Closed,
}

/// Errors surfaced by the repositories.
///
/// Lookup misses are not errors: they come back as `Ok(None)` or an empty `Vec`.
#[derive(Error, Debug)]
pub enum RepoError {
    /// Target of a write does not exist (or is inactive).
    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Validation(String),

    /// Driver or connectivity failure. Display stays generic so callers can
    /// forward it without leaking SQL or paths.
    #[error("store unavailable")]
    StoreUnavailable(#[source] sqlx::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("credential processing failed: {0}")]
    Credential(String),

    #[error("invalid or expired token")]
    Token(#[source] jsonwebtoken::errors::Error),

    /// A stored row could not be turned back into a domain value.
    #[error("stored record is malformed: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                RepoError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                RepoError::Validation(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                RepoError::NotFound
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                RepoError::Corrupt(err.to_string())
            }
            _ => RepoError::StoreUnavailable(err),
        }
    }
}

impl RepoError {
    /// True when the failure came from the connection itself rather than from
    /// the statement, so the connection must not be reused.
    pub(crate) fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            RepoError::StoreUnavailable(
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailable_message_hides_driver_details() {
        let err = RepoError::from(sqlx::Error::Protocol("secret table layout".into()));
        assert_eq!(err.to_string(), "store unavailable");
        assert!(err.is_connection_fault());
    }

    #[test]
    fn row_not_found_is_store_error_not_lookup_miss() {
        let err = RepoError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, RepoError::StoreUnavailable(_)));
        assert!(!err.is_connection_fault());
    }

    #[test]
    fn pool_errors_pass_through() {
        let err = RepoError::from(PoolError::Closed);
        assert_eq!(err.to_string(), "connection pool is closed");
    }
}
