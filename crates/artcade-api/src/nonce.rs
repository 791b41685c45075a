use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::debug;

use artcade_crypto::tokens::generate_nonce;
use artcade_db::Database;

use crate::error::AuthError;
use crate::session::expiry_after;

/// Hands out single-use SIWE challenges.
#[derive(Clone)]
pub struct NonceIssuer {
    db: Arc<Database>,
    expiration: Duration,
}

impl NonceIssuer {
    pub fn new(db: Arc<Database>, expiration: Duration) -> Self {
        Self { db, expiration }
    }

    pub fn issue_nonce(&self) -> Result<String, AuthError> {
        let value = generate_nonce();
        let expires_at = expiry_after(Utc::now(), self.expiration)?;
        self.db.insert_nonce(&value, expires_at)?;

        debug!("Issued nonce expiring at {}", expires_at);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_nonce_is_stored_with_expiry() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let issuer = NonceIssuer::new(db.clone(), Duration::minutes(15));

        let value = issuer.issue_nonce().unwrap();
        assert_eq!(value.len(), 32);

        let row = db.get_nonce(&value).unwrap().unwrap();
        let remaining = row.expires_at - Utc::now();
        assert!(remaining > Duration::minutes(14) && remaining <= Duration::minutes(15));

        assert_ne!(issuer.issue_nonce().unwrap(), value);
    }
}
