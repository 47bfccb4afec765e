//! User and session data access over a pooled SQLite store.
//!
//! [`state::AppState`] wires a [`db::ConnectionPool`] into the
//! [`users::UserRepository`] and [`sessions::SessionRepository`]; the
//! [`auth`] functions combine them into login, token resolution and logout.

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod sessions;
pub mod state;
pub mod users;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{PoolError, RepoError};
pub use state::AppState;
