//! Login sessions and the signed tokens that refer to them.

pub mod dto;
pub mod repo;
pub mod repo_types;
pub mod tokens;

pub use dto::NewSession;
pub use repo::SessionRepository;
pub use repo_types::Session;
pub use tokens::{Claims, SessionTokens};
