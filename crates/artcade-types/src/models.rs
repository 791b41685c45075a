use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public projection of a user account.
///
/// `eth_address` is absent for accounts created by admin tooling without a
/// wallet; when present it is always lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub eth_address: Option<String>,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
