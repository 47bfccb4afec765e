use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::clock::to_millis;
use crate::config::TokenConfig;
use crate::error::RepoError;
use crate::sessions::repo_types::Session;

/// Payload of a session token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: i64,  // user ID
    pub sid: Uuid, // session ID
    pub iat: i64,  // issued at (unix seconds)
    pub exp: i64,  // session expiry (unix seconds, rounded up)
    pub exp_ms: i64, // session expiry (unix milliseconds)
    pub iss: String,
    pub aud: String,
}

/// Signs and checks HMAC-SHA256 session tokens.
///
/// Expiry is checked against the caller's clock rather than the wall clock so
/// that it agrees with the session store.
#[derive(Clone)]
pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
}

impl SessionTokens {
    pub fn new(config: &TokenConfig) -> Result<Self, RepoError> {
        if config.secret.len() < 16 {
            return Err(RepoError::Validation(
                "token secret must be at least 16 bytes".into(),
            ));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        })
    }

    pub fn issue(&self, session: &Session) -> Result<String, RepoError> {
        let exp_ms = to_millis(session.expires_at);
        let claims = Claims {
            sub: session.user_id,
            sid: session.id,
            iat: session.created_at.unix_timestamp(),
            exp: ceil_seconds(exp_ms),
            exp_ms,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(RepoError::Token)?;
        debug!(session_id = %session.id, user_id = session.user_id, "session token issued");
        Ok(token)
    }

    pub fn verify(&self, token: &str, now: OffsetDateTime) -> Result<Claims, RepoError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.validate_exp = false;
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(RepoError::Token)?;
        if data.claims.exp_ms <= to_millis(now) {
            return Err(RepoError::Token(ErrorKind::ExpiredSignature.into()));
        }
        debug!(session_id = %data.claims.sid, "session token verified");
        Ok(data.claims)
    }
}

fn ceil_seconds(ms: i64) -> i64 {
    ms.div_euclid(1000) + i64::from(ms.rem_euclid(1000) != 0)
}
