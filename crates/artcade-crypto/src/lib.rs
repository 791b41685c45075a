/// Artcade Crypto Library
///
/// Credential primitives for the auth service: random challenge and token
/// generation, token digests for storage, CSRF secret masking, and recovery
/// of the Ethereum address that signed a personal message.

pub mod csrf;
pub mod signature;
pub mod tokens;
