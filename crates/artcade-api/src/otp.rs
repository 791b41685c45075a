use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use artcade_crypto::tokens::generate_otp_code;
use artcade_db::Database;
use artcade_db::models::{OtpRedemption, UserRow};

use crate::error::AuthError;
use crate::session::{IssuedSession, SessionManager, expiry_after};

/// Fresh codes to draw before giving up on a crowded code space.
const MAX_CODE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct IssuedOtp {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RedeemedOtp {
    pub user: UserRow,
    pub session: IssuedSession,
}

/// Links a second device to an already signed-in user via short codes.
#[derive(Clone)]
pub struct OtpLinker {
    db: Arc<Database>,
    sessions: SessionManager,
    expiration: Duration,
}

impl OtpLinker {
    pub fn new(db: Arc<Database>, sessions: SessionManager, expiration: Duration) -> Self {
        Self {
            db,
            sessions,
            expiration,
        }
    }

    pub fn issue_otp(&self, user: &UserRow) -> Result<IssuedOtp, AuthError> {
        let expires_at = expiry_after(Utc::now(), self.expiration)?;

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_otp_code();
            if self.db.insert_otp(&code, &user.id, expires_at)? {
                info!("Issued OTP for {}", user.username);
                return Ok(IssuedOtp { code, expires_at });
            }
        }

        Err(anyhow!("No free OTP code after {} attempts", MAX_CODE_ATTEMPTS).into())
    }

    /// The code alone identifies the user; the caller makes no identity claim.
    pub fn redeem_otp(&self, code: &str) -> Result<RedeemedOtp, AuthError> {
        let user = match self.db.redeem_otp(code, Utc::now())? {
            OtpRedemption::Redeemed { user } => user,
            OtpRedemption::Expired => {
                warn!("Expired OTP presented");
                return Err(AuthError::OtpExpired);
            }
            OtpRedemption::Missing => return Err(AuthError::OtpInvalid),
        };

        let session = self.sessions.create_session(&user)?;
        info!("{} linked a device with an OTP", user.username);

        Ok(RedeemedOtp { user, session })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPolicy;

    fn setup() -> (Arc<Database>, OtpLinker, SessionManager, UserRow) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = db.create_user("player", None).unwrap();
        let sessions = SessionManager::new(db.clone(), SessionPolicy::default());
        let otps = OtpLinker::new(db.clone(), sessions.clone(), Duration::minutes(5));
        (db, otps, sessions, user)
    }

    #[test]
    fn issued_code_has_fixed_length() {
        let (db, otps, _, user) = setup();
        let otp = otps.issue_otp(&user).unwrap();
        assert_eq!(otp.code.len(), 6);
        assert_eq!(db.get_otp(&otp.code).unwrap().unwrap().user_id, user.id);
    }

    #[test]
    fn redeem_succeeds_once_for_owner() {
        let (_db, otps, sessions, user) = setup();
        let otp = otps.issue_otp(&user).unwrap();

        let redeemed = otps.redeem_otp(&otp.code).unwrap();
        assert_eq!(redeemed.user.id, user.id);
        let resolved = sessions.resolve_session(&redeemed.session.token).unwrap();
        assert_eq!(resolved.user.id, user.id);

        assert!(matches!(
            otps.redeem_otp(&otp.code),
            Err(AuthError::OtpInvalid)
        ));
    }

    #[test]
    fn expired_code_never_validates() {
        let (db, otps, _, user) = setup();
        db.insert_otp("c0ffee", &user.id, Utc::now() - Duration::seconds(1))
            .unwrap();

        for _ in 0..2 {
            assert!(matches!(
                otps.redeem_otp("c0ffee"),
                Err(AuthError::OtpExpired)
            ));
        }
    }

    #[test]
    fn several_codes_may_coexist() {
        let (_db, otps, _, user) = setup();
        let a = otps.issue_otp(&user).unwrap();
        let b = otps.issue_otp(&user).unwrap();
        assert!(otps.redeem_otp(&b.code).is_ok());
        assert!(otps.redeem_otp(&a.code).is_ok());
    }
}
