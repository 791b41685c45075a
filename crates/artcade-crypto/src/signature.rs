use alloy_primitives::{Address, Signature};
use anyhow::{Result, anyhow};

/// Decode a 65-byte `r || s || v` signature given as hex, with or without a
/// `0x` prefix.
pub fn decode_signature(signature_hex: &str) -> Result<Signature> {
    let raw = signature_hex.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw)?;
    Signature::try_from(bytes.as_slice()).map_err(|e| anyhow!("Invalid signature: {}", e))
}

/// Recover the address that produced `signature_hex` over the EIP-191
/// personal-message hash of `message`.
pub fn recover_signer(message: &str, signature_hex: &str) -> Result<Address> {
    let signature = decode_signature(signature_hex)?;
    signature
        .recover_address_from_msg(message.as_bytes())
        .map_err(|e| anyhow!("Signer recovery failed: {}", e))
}
