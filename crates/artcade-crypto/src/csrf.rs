use anyhow::{Result, anyhow};
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Bytes of entropy in a CSRF secret.
pub const CSRF_SECRET_LENGTH: usize = 16;

/// A fresh secret for the CSRF cookie, hex encoded.
pub fn generate_csrf_secret() -> String {
    let mut secret = [0u8; CSRF_SECRET_LENGTH];
    rand::rng().fill_bytes(&mut secret);
    hex::encode(secret)
}

/// Mask a secret with a one-time pad so every token handed to the client is
/// different while still unmasking to the same secret.
///
/// Output is `hex(pad || secret ^ pad)`.
pub fn mask_csrf_secret(secret: &str) -> Result<String> {
    let secret = decode_secret(secret).ok_or_else(|| anyhow!("Malformed CSRF secret"))?;

    let mut pad = [0u8; CSRF_SECRET_LENGTH];
    rand::rng().fill_bytes(&mut pad);

    let mut out = Vec::with_capacity(CSRF_SECRET_LENGTH * 2);
    out.extend_from_slice(&pad);
    out.extend(secret.iter().zip(pad.iter()).map(|(s, p)| s ^ p));
    Ok(hex::encode(out))
}

/// Recover the secret from a client-supplied token.
///
/// Accepts either a masked token or the raw secret itself.
pub fn unmask_csrf_token(token: &str) -> Option<[u8; CSRF_SECRET_LENGTH]> {
    if token.len() == CSRF_SECRET_LENGTH * 2 {
        return decode_secret(token);
    }
    if token.len() != CSRF_SECRET_LENGTH * 4 {
        return None;
    }

    let bytes = hex::decode(token).ok()?;
    let (pad, masked) = bytes.split_at(CSRF_SECRET_LENGTH);
    let mut secret = [0u8; CSRF_SECRET_LENGTH];
    for (i, (m, p)) in masked.iter().zip(pad.iter()).enumerate() {
        secret[i] = m ^ p;
    }
    Some(secret)
}

/// Parse a stored (cookie) secret. `None` means the cookie is unusable.
pub fn decode_secret(secret: &str) -> Option<[u8; CSRF_SECRET_LENGTH]> {
    if secret.len() != CSRF_SECRET_LENGTH * 2 {
        return None;
    }
    hex::decode(secret).ok()?.try_into().ok()
}

/// Constant-time comparison of a cookie secret and an echoed token.
pub fn csrf_token_matches(secret: &[u8; CSRF_SECRET_LENGTH], token: &str) -> bool {
    match unmask_csrf_token(token) {
        Some(candidate) => bool::from(candidate.ct_eq(secret)),
        None => false,
    }
}
