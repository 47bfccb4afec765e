//! Login flow on top of the user and session repositories.

use tracing::{info, instrument, warn};

use crate::error::{RepoError, Result};
use crate::sessions::{NewSession, Session};
use crate::state::AppState;
use crate::users::User;

/// Result of a successful login. `token` is the only value to give the client.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub session: Session,
    pub token: String,
}

/// Checks credentials and opens a session. `None` on bad credentials.
#[instrument(skip(state, email, password, client))]
pub async fn login(
    state: &AppState,
    email: &str,
    password: &str,
    client: NewSession,
) -> Result<Option<LoginOutcome>> {
    let Some(user) = state.users.authenticate(email, password).await? else {
        return Ok(None);
    };
    let session = state.sessions.create(user.id, client).await?;
    let token = state.tokens.issue(&session)?;
    info!(user_id = user.id, session_id = %session.id, "login succeeded");
    Ok(Some(LoginOutcome {
        user,
        session,
        token,
    }))
}

/// Maps a token back to its active session and user. `None` when the token is
/// invalid or expired, the session is gone, or the user was deactivated.
#[instrument(skip(state, token))]
pub async fn resolve(state: &AppState, token: &str) -> Result<Option<(User, Session)>> {
    let claims = match state.tokens.verify(token, state.clock.now()) {
        Ok(claims) => claims,
        Err(RepoError::Token(e)) => {
            warn!(error = %e, "rejected session token");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let Some(session) = state.sessions.get(claims.sid).await? else {
        return Ok(None);
    };
    if session.user_id != claims.sub {
        warn!(session_id = %session.id, "token subject does not own session");
        return Ok(None);
    }
    let Some(user) = state.users.get_by_id(session.user_id).await? else {
        return Ok(None);
    };
    Ok(Some((user, session)))
}

/// Revokes the session behind a token. Returns whether anything was revoked.
#[instrument(skip(state, token))]
pub async fn logout(state: &AppState, token: &str) -> Result<bool> {
    match state.tokens.verify(token, state.clock.now()) {
        Ok(claims) => state.sessions.revoke(claims.sid).await,
        Err(RepoError::Token(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;
    use crate::users::NewUser;

    async fn env_with_user() -> (TestEnv, User) {
        let env = TestEnv::new().await;
        let user = env
            .state
            .users
            .create(NewUser::new("ann", "ann@example.com", "password-123"))
            .await
            .unwrap();
        (env, user)
    }

    #[tokio::test]
    async fn login_then_resolve() {
        let (env, user) = env_with_user().await;
        let outcome = login(
            &env.state,
            "ann@example.com",
            "password-123",
            NewSession::new("10.1.1.1", "firefox"),
        )
        .await
        .unwrap()
        .expect("credentials valid");
        assert_eq!(outcome.user.id, user.id);
        assert_eq!(outcome.session.user_id, user.id);

        let (resolved_user, resolved_session) = resolve(&env.state, &outcome.token)
            .await
            .unwrap()
            .expect("token resolves");
        assert_eq!(resolved_user.id, user.id);
        assert_eq!(resolved_session.id, outcome.session.id);
    }

    #[tokio::test]
    async fn bad_password_opens_no_session() {
        let (env, user) = env_with_user().await;
        let outcome = login(&env.state, "ann@example.com", "nope-nope", NewSession::new("ip", "ua"))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(env.state.sessions.list_sessions(user.id, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_fails_after_expiry_logout_or_deactivation() {
        let (env, user) = env_with_user().await;
        let client = || NewSession::new("ip", "ua").with_ttl(time::Duration::minutes(30));

        let expiring = login(&env.state, "ann@example.com", "password-123", client())
            .await
            .unwrap()
            .unwrap();
        env.clock.advance(time::Duration::minutes(31));
        assert!(resolve(&env.state, &expiring.token).await.unwrap().is_none());

        let logged_out = login(&env.state, "ann@example.com", "password-123", client())
            .await
            .unwrap()
            .unwrap();
        assert!(logout(&env.state, &logged_out.token).await.unwrap());
        assert!(!logout(&env.state, &logged_out.token).await.unwrap());
        assert!(resolve(&env.state, &logged_out.token).await.unwrap().is_none());

        let deactivated = login(&env.state, "ann@example.com", "password-123", client())
            .await
            .unwrap()
            .unwrap();
        env.state.users.deactivate(user.id).await.unwrap();
        assert!(resolve(&env.state, &deactivated.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_token_resolves_to_none() {
        let (env, _) = env_with_user().await;
        assert!(resolve(&env.state, "not.a.token").await.unwrap().is_none());
        assert!(!logout(&env.state, "not.a.token").await.unwrap());
    }
}
