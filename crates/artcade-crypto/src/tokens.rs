use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes behind a SIWE nonce (32 hex chars).
pub const NONCE_LENGTH: usize = 16;

/// Random bytes behind an OTP code (6 hex chars).
pub const OTP_LENGTH: usize = 3;

/// Random bytes behind a session token (64 hex chars).
pub const SESSION_TOKEN_LENGTH: usize = 32;

/// Hex-encode `len` bytes from the thread-local CSPRNG.
pub fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn generate_nonce() -> String {
    random_hex(NONCE_LENGTH)
}

pub fn generate_otp_code() -> String {
    random_hex(OTP_LENGTH)
}

pub fn generate_session_token() -> String {
    random_hex(SESSION_TOKEN_LENGTH)
}

/// Session tokens are only ever stored as this digest.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
