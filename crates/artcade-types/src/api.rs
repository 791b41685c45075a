use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::UserInfo;

// -- Nonce --

#[derive(Debug, Serialize, Deserialize)]
pub struct NonceResponse {
    pub value: String,
}

// -- SIWE login --

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub message: String,
    pub signature: String,
}

/// Body returned by every successful login path (SIWE and OTP).
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expiry: DateTime<Utc>,
    pub user: UserInfo,
}

// -- OTP --

#[derive(Debug, Serialize, Deserialize)]
pub struct OtpResponse {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OtpLoginRequest {
    pub code: String,
}

// -- Errors --

/// Error body shared by all auth failures. `code` is stable and machine
/// readable, `detail` is meant for humans.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
    pub code: String,
}

// -- Health --

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub db: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}
