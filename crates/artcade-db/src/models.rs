/// Database row types. These map directly to SQLite rows.
/// Distinct from artcade-types API models to keep the DB layer independent.
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: String,
    pub eth_address: Option<String>,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NonceRow {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OtpRow {
    pub code: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub digest: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of atomically consuming a login nonce.
#[derive(Debug)]
pub enum NonceConsumption {
    /// Nonce deleted; the user was found or created in the same transaction.
    Consumed { user: UserRow, created: bool },
    Expired,
    Missing,
}

/// Outcome of atomically redeeming an OTP.
#[derive(Debug)]
pub enum OtpRedemption {
    Redeemed { user: UserRow },
    Expired,
    Missing,
}

/// Rows removed by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeCounts {
    pub nonces: usize,
    pub otps: usize,
    pub sessions: usize,
}

impl PurgeCounts {
    pub fn total(&self) -> usize {
        self.nonces + self.otps + self.sessions
    }
}
