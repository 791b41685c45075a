use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use artcade_crypto::tokens::{generate_session_token, token_digest};
use artcade_db::Database;
use artcade_db::models::UserRow;

use crate::config::SessionPolicy;
use crate::error::AuthError;

/// A freshly minted session. `token` is the only copy of the raw value.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub user: UserRow,
    pub expiry: DateTime<Utc>,
    /// Set when this lookup slid the expiry forward.
    pub refreshed: bool,
}

/// Owns the lifecycle of bearer sessions.
#[derive(Clone)]
pub struct SessionManager {
    db: Arc<Database>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(db: Arc<Database>, policy: SessionPolicy) -> Self {
        Self { db, policy }
    }

    pub fn create_session(&self, user: &UserRow) -> Result<IssuedSession, AuthError> {
        let now = Utc::now();

        if let Some(limit) = self.policy.token_limit_per_user {
            if self.db.count_active_sessions(&user.id, now)? >= limit {
                return Err(AuthError::TokenLimitExceeded);
            }
        }

        let token = generate_session_token();
        let expiry = expiry_after(now, self.policy.ttl)?;
        self.db
            .insert_session(&token_digest(&token), &user.id, now, expiry)?;

        debug!("Created session for {} expiring at {}", user.username, expiry);
        Ok(IssuedSession { token, expiry })
    }

    /// Map a raw token (from header or cookie) to its user.
    ///
    /// Expired sessions are purged on sight. With auto-refresh on, a valid
    /// session's expiry slides to `now + ttl`.
    pub fn resolve_session(&self, token: &str) -> Result<ResolvedSession, AuthError> {
        let now = Utc::now();
        let digest = token_digest(token);

        let session = self
            .db
            .get_session(&digest)?
            .ok_or(AuthError::Unauthenticated)?;

        if session.expires_at <= now {
            self.db.delete_session(&digest)?;
            return Err(AuthError::Unauthenticated);
        }

        let user = self
            .db
            .get_user_by_id(&session.user_id)?
            .ok_or(AuthError::Unauthenticated)?;

        let mut expiry = session.expires_at;
        let mut refreshed = false;
        if self.policy.auto_refresh {
            let renewed = expiry_after(now, self.policy.ttl)?;
            if renewed - expiry > self.policy.min_refresh_interval {
                self.db.extend_session(&digest, renewed)?;
                expiry = renewed;
                refreshed = true;
            }
        }

        Ok(ResolvedSession {
            user,
            expiry,
            refreshed,
        })
    }

    /// Delete the one session behind `token`. Unknown tokens are fine.
    pub fn revoke_session(&self, token: &str) -> Result<(), AuthError> {
        if self.db.delete_session(&token_digest(token))? {
            info!("Session revoked");
        }
        Ok(())
    }

    pub fn revoke_all_sessions(&self, user: &UserRow) -> Result<usize, AuthError> {
        let n = self.db.delete_user_sessions(&user.id)?;
        info!("Revoked {} sessions for {}", n, user.username);
        Ok(n)
    }
}

/// `now + lifetime`, as an error instead of a panic when out of range.
pub(crate) fn expiry_after(
    now: DateTime<Utc>,
    lifetime: Duration,
) -> Result<DateTime<Utc>, AuthError> {
    now.checked_add_signed(lifetime)
        .ok_or_else(|| anyhow!("Lifetime {} overflows the clock", lifetime).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(policy: SessionPolicy) -> (Arc<Database>, SessionManager, UserRow) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = db.create_user("player", Some("0x00000000000000000000000000000000000000aa")).unwrap();
        let sessions = SessionManager::new(db.clone(), policy);
        (db, sessions, user)
    }

    fn no_refresh() -> SessionPolicy {
        SessionPolicy {
            auto_refresh: false,
            ..SessionPolicy::default()
        }
    }

    #[test]
    fn created_session_resolves_to_user() {
        let (_db, sessions, user) = setup(no_refresh());
        let issued = sessions.create_session(&user).unwrap();

        let resolved = sessions.resolve_session(&issued.token).unwrap();
        assert_eq!(resolved.user.id, user.id);
        assert_eq!(resolved.expiry.timestamp(), issued.expiry.timestamp());
    }

    #[test]
    fn each_login_mints_a_distinct_token() {
        let (db, sessions, user) = setup(no_refresh());
        let a = sessions.create_session(&user).unwrap();
        let b = sessions.create_session(&user).unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(db.count_active_sessions(&user.id, Utc::now()).unwrap(), 2);
    }

    #[test]
    fn unknown_and_expired_tokens_are_rejected() {
        let (db, sessions, user) = setup(no_refresh());
        assert!(matches!(
            sessions.resolve_session("nope"),
            Err(AuthError::Unauthenticated)
        ));

        let token = "expired-token";
        let past = Utc::now() - Duration::minutes(1);
        db.insert_session(&token_digest(token), &user.id, past, past).unwrap();

        assert!(matches!(
            sessions.resolve_session(token),
            Err(AuthError::Unauthenticated)
        ));
        // purged on sight
        assert!(db.get_session(&token_digest(token)).unwrap().is_none());
    }

    #[test]
    fn revoke_is_idempotent() {
        let (_db, sessions, user) = setup(no_refresh());
        let issued = sessions.create_session(&user).unwrap();

        sessions.revoke_session(&issued.token).unwrap();
        sessions.revoke_session(&issued.token).unwrap();
        assert!(sessions.resolve_session(&issued.token).is_err());
    }

    #[test]
    fn revoke_all_invalidates_every_token() {
        let (_db, sessions, user) = setup(no_refresh());
        let tokens: Vec<_> = (0..3)
            .map(|_| sessions.create_session(&user).unwrap().token)
            .collect();

        assert_eq!(sessions.revoke_all_sessions(&user).unwrap(), 3);
        for token in tokens {
            assert!(matches!(
                sessions.resolve_session(&token),
                Err(AuthError::Unauthenticated)
            ));
        }
    }

    #[test]
    fn auto_refresh_slides_expiry() {
        let (db, sessions, user) = setup(SessionPolicy::default());
        let token = "sliding-token";
        let now = Utc::now();
        db.insert_session(&token_digest(token), &user.id, now, now + Duration::days(1))
            .unwrap();

        let resolved = sessions.resolve_session(token).unwrap();
        assert!(resolved.refreshed);
        assert!(resolved.expiry > now + Duration::days(6));

        let stored = db.get_session(&token_digest(token)).unwrap().unwrap();
        assert_eq!(stored.expires_at.timestamp(), resolved.expiry.timestamp());
    }

    #[test]
    fn refresh_skipped_within_min_interval() {
        let (db, sessions, user) = setup(SessionPolicy::default());
        let issued = sessions.create_session(&user).unwrap();

        assert!(!sessions.resolve_session(&issued.token).unwrap().refreshed);
        let stored = db.get_session(&token_digest(&issued.token)).unwrap().unwrap();
        assert_eq!(stored.expires_at.timestamp(), issued.expiry.timestamp());
    }

    #[test]
    fn overflowing_ttl_is_an_error() {
        let (_db, sessions, user) = setup(SessionPolicy {
            ttl: Duration::seconds(1_000_000_000_000_000),
            ..no_refresh()
        });
        assert!(matches!(
            sessions.create_session(&user),
            Err(AuthError::Infrastructure(_))
        ));
    }

    #[test]
    fn token_limit_is_enforced() {
        let (_db, sessions, user) = setup(SessionPolicy {
            token_limit_per_user: Some(2),
            ..no_refresh()
        });
        sessions.create_session(&user).unwrap();
        sessions.create_session(&user).unwrap();
        assert!(matches!(
            sessions.create_session(&user),
            Err(AuthError::TokenLimitExceeded)
        ));
    }
}
