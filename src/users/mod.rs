//! User accounts and profiles.

pub mod dto;
pub mod password;
pub mod repo;
pub mod repo_types;
pub(crate) mod services;

pub use dto::{NewUser, ProfileUpdate};
pub use password::Credentials;
pub use repo::UserRepository;
pub use repo_types::{Role, User, UserProfile};
