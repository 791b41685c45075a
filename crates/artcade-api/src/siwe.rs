use std::sync::Arc;

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use artcade_crypto::signature::recover_signer;
use artcade_db::Database;
use artcade_db::models::{NonceConsumption, UserRow};

use crate::error::AuthError;
use crate::session::{IssuedSession, SessionManager};

const SIWE_HEADER_SUFFIX: &str = " wants you to sign in with your Ethereum account:";

/// Fields of an EIP-4361 message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiweMessage {
    pub domain: String,
    pub address: Address,
    pub statement: Option<String>,
    pub uri: String,
    pub version: String,
    pub chain_id: u64,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub request_id: Option<String>,
    pub resources: Vec<String>,
}

pub fn parse_siwe_message(raw: &str) -> Result<SiweMessage, AuthError> {
    let mut lines = raw.lines();

    let domain = lines
        .next()
        .and_then(|line| line.trim().strip_suffix(SIWE_HEADER_SUFFIX))
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| malformed("invalid header line"))?
        .to_string();

    let address = lines
        .next()
        .map(str::trim)
        .and_then(|line| line.parse::<Address>().ok())
        .ok_or_else(|| malformed("invalid address"))?;

    let mut statement = None;
    let mut uri = None;
    let mut version = None;
    let mut chain_id = None;
    let mut nonce = None;
    let mut issued_at = None;
    let mut expiration_time = None;
    let mut not_before = None;
    let mut request_id = None;
    let mut resources = Vec::new();
    let mut in_resources = false;

    for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
        if in_resources {
            let resource = line
                .strip_prefix("- ")
                .ok_or_else(|| malformed("unexpected line after resources"))?;
            resources.push(resource.trim().to_string());
            continue;
        }
        if line == "Resources:" {
            in_resources = true;
            continue;
        }

        match line.split_once(": ") {
            Some(("URI", v)) => uri = Some(v.trim().to_string()),
            Some(("Version", v)) => version = Some(v.trim().to_string()),
            Some(("Chain ID", v)) => {
                chain_id = Some(v.trim().parse::<u64>().map_err(|_| malformed("invalid chain id"))?)
            }
            Some(("Nonce", v)) => nonce = Some(v.trim().to_string()),
            Some(("Issued At", v)) => issued_at = Some(parse_timestamp("issued at", v)?),
            Some(("Expiration Time", v)) => {
                expiration_time = Some(parse_timestamp("expiration time", v)?)
            }
            Some(("Not Before", v)) => not_before = Some(parse_timestamp("not before", v)?),
            Some(("Request ID", v)) => request_id = Some(v.trim().to_string()),
            // the free-form statement sits between the address and the fields
            _ if statement.is_none() && uri.is_none() => statement = Some(line.to_string()),
            _ => return Err(malformed("unrecognised line")),
        }
    }

    Ok(SiweMessage {
        domain,
        address,
        statement,
        uri: uri.ok_or_else(|| malformed("missing uri"))?,
        version: version.ok_or_else(|| malformed("missing version"))?,
        chain_id: chain_id.ok_or_else(|| malformed("missing chain id"))?,
        nonce: nonce
            .filter(|n| !n.is_empty())
            .ok_or_else(|| malformed("missing nonce"))?,
        issued_at: issued_at.ok_or_else(|| malformed("missing issued at"))?,
        expiration_time,
        not_before,
        request_id,
        resources,
    })
}

fn parse_timestamp(label: &str, raw: &str) -> Result<DateTime<Utc>, AuthError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| malformed(&format!("invalid {} timestamp", label)))
}

fn malformed(reason: &str) -> AuthError {
    AuthError::InvalidMessage(reason.to_string())
}

/// Result of a successful wallet sign-in.
#[derive(Debug)]
pub struct VerifiedLogin {
    pub user: UserRow,
    pub created: bool,
    pub session: IssuedSession,
}

/// Checks signed SIWE messages against outstanding nonces.
#[derive(Clone)]
pub struct SiweVerifier {
    db: Arc<Database>,
    sessions: SessionManager,
    expected_domain: Option<String>,
}

impl SiweVerifier {
    pub fn new(db: Arc<Database>, sessions: SessionManager, expected_domain: Option<String>) -> Self {
        Self {
            db,
            sessions,
            expected_domain,
        }
    }

    pub fn verify_login(&self, message: &str, signature: &str) -> Result<VerifiedLogin, AuthError> {
        let parsed = parse_siwe_message(message)?;
        let now = Utc::now();

        match self.db.get_nonce(&parsed.nonce)? {
            None => return Err(AuthError::InvalidNonce),
            Some(nonce) if nonce.expires_at <= now => return Err(AuthError::NonceExpired),
            Some(_) => {}
        }

        self.check_signature(&parsed, message, signature, now)?;

        // A nonce that vanished or expired since the lookup above lost a race.
        let (user, created) =
            match self
                .db
                .consume_nonce_for_login(&parsed.nonce, &parsed.address.to_string(), now)?
            {
                NonceConsumption::Consumed { user, created } => (user, created),
                NonceConsumption::Expired => return Err(AuthError::NonceExpired),
                NonceConsumption::Missing => return Err(AuthError::InvalidNonce),
            };

        let session = self.sessions.create_session(&user)?;
        info!(
            "{} signed in with wallet (new user: {})",
            user.username, created
        );

        Ok(VerifiedLogin {
            user,
            created,
            session,
        })
    }

    /// The recovered signer is authoritative; the address written in the
    /// message has to agree with it.
    fn check_signature(
        &self,
        parsed: &SiweMessage,
        raw: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        if parsed.version != "1" {
            warn!("Rejected SIWE message with version {:?}", parsed.version);
            return Err(AuthError::InvalidSignature);
        }
        if let Some(expected) = &self.expected_domain {
            if !parsed.domain.eq_ignore_ascii_case(expected) {
                warn!("Rejected SIWE message for domain {:?}", parsed.domain);
                return Err(AuthError::InvalidSignature);
            }
        }
        if parsed.expiration_time.is_some_and(|t| t <= now)
            || parsed.not_before.is_some_and(|t| t > now)
        {
            return Err(AuthError::InvalidSignature);
        }

        match recover_signer(raw, signature) {
            Ok(signer) if signer == parsed.address => Ok(()),
            Ok(signer) => {
                warn!("SIWE signer {} does not match {}", signer, parsed.address);
                Err(AuthError::InvalidSignature)
            }
            Err(e) => {
                warn!("SIWE signature rejected: {}", e);
                Err(AuthError::InvalidSignature)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPolicy;
    use alloy::signers::SignerSync;
    use alloy::signers::local::PrivateKeySigner;
    use chrono::Duration;

    fn message_for(address: &str, nonce: &str) -> String {
        format!(
            "artcade.xyz wants you to sign in with your Ethereum account:\n\
             {address}\n\
             \n\
             Sign in to access Artcade\n\
             \n\
             URI: https://artcade.xyz\n\
             Version: 1\n\
             Chain ID: 360\n\
             Nonce: {nonce}\n\
             Issued At: {}",
            Utc::now().to_rfc3339()
        )
    }

    fn sign(signer: &PrivateKeySigner, message: &str) -> String {
        let sig = signer.sign_message_sync(message.as_bytes()).unwrap();
        format!("0x{}", hex::encode(sig.as_bytes()))
    }

    fn verifier() -> (Arc<Database>, SiweVerifier) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sessions = SessionManager::new(db.clone(), SessionPolicy::default());
        (db.clone(), SiweVerifier::new(db, sessions, None))
    }

    #[test]
    fn parses_full_message() {
        let raw = "example.com wants you to sign in with your Ethereum account:\n\
                   0x71C7656EC7ab88b098defB751B7401B5f6d8976F\n\
                   \n\
                   Sign in please\n\
                   \n\
                   URI: https://example.com/login\n\
                   Version: 1\n\
                   Chain ID: 1\n\
                   Nonce: abc123\n\
                   Issued At: 2024-05-01T12:00:00Z\n\
                   Expiration Time: 2024-05-01T12:15:00+00:00\n\
                   Request ID: req-1\n\
                   Resources:\n\
                   - ipfs://one\n\
                   - https://two";

        let msg = parse_siwe_message(raw).unwrap();
        assert_eq!(msg.domain, "example.com");
        assert_eq!(msg.statement.as_deref(), Some("Sign in please"));
        assert_eq!(msg.uri, "https://example.com/login");
        assert_eq!(msg.chain_id, 1);
        assert_eq!(msg.nonce, "abc123");
        assert!(msg.expiration_time.is_some());
        assert_eq!(msg.request_id.as_deref(), Some("req-1"));
        assert_eq!(msg.resources, vec!["ipfs://one", "https://two"]);
    }

    #[test]
    fn statement_is_optional() {
        let raw = "example.com wants you to sign in with your Ethereum account:\n\
                   0x71C7656EC7ab88b098defB751B7401B5f6d8976F\n\
                   \n\
                   URI: https://example.com\n\
                   Version: 1\n\
                   Chain ID: 1\n\
                   Nonce: abc123\n\
                   Issued At: 2024-05-01T12:00:00Z";
        assert_eq!(parse_siwe_message(raw).unwrap().statement, None);
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(matches!(
            parse_siwe_message("hello"),
            Err(AuthError::InvalidMessage(_))
        ));
        let missing_nonce = "example.com wants you to sign in with your Ethereum account:\n\
                             0x71C7656EC7ab88b098defB751B7401B5f6d8976F\n\
                             \n\
                             URI: https://example.com\n\
                             Version: 1\n\
                             Chain ID: 1\n\
                             Issued At: 2024-05-01T12:00:00Z";
        assert!(matches!(
            parse_siwe_message(missing_nonce),
            Err(AuthError::InvalidMessage(_))
        ));
    }

    #[test]
    fn valid_login_consumes_nonce() {
        let (db, verifier) = verifier();
        let signer = PrivateKeySigner::random();
        db.insert_nonce("nonce-1", Utc::now() + Duration::minutes(15)).unwrap();

        let message = message_for(&signer.address().to_string(), "nonce-1");
        let login = verifier.verify_login(&message, &sign(&signer, &message)).unwrap();

        let address = signer.address().to_string().to_lowercase();
        assert!(login.created);
        assert_eq!(login.user.eth_address.as_deref(), Some(address.as_str()));
        assert_eq!(login.user.username, address);
        assert!(db.get_nonce("nonce-1").unwrap().is_none());

        // replay of the same signed message
        assert!(matches!(
            verifier.verify_login(&message, &sign(&signer, &message)),
            Err(AuthError::InvalidNonce)
        ));
    }

    #[test]
    fn concurrent_logins_on_one_nonce_have_one_winner() {
        let (db, verifier) = verifier();
        let signer = PrivateKeySigner::random();
        db.insert_nonce("contested", Utc::now() + Duration::minutes(15)).unwrap();

        let message = message_for(&signer.address().to_string(), "contested");
        let signature = sign(&signer, &message);
        let barrier = std::sync::Barrier::new(2);

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        verifier.verify_login(&message, &signature)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(AuthError::InvalidNonce)))
        );
        assert!(db.get_nonce("contested").unwrap().is_none());
    }

    #[test]
    fn expired_nonce_fails_even_with_valid_signature() {
        let (db, verifier) = verifier();
        let signer = PrivateKeySigner::random();
        db.insert_nonce("stale", Utc::now() - Duration::seconds(1)).unwrap();

        let message = message_for(&signer.address().to_string(), "stale");
        let signature = sign(&signer, &message);
        for _ in 0..2 {
            assert!(matches!(
                verifier.verify_login(&message, &signature),
                Err(AuthError::NonceExpired)
            ));
        }
    }

    #[test]
    fn flipped_signature_byte_is_rejected() {
        let (db, verifier) = verifier();
        let signer = PrivateKeySigner::random();
        db.insert_nonce("n", Utc::now() + Duration::minutes(15)).unwrap();

        let message = message_for(&signer.address().to_string(), "n");
        let sig = signer.sign_message_sync(message.as_bytes()).unwrap();
        let mut bytes = sig.as_bytes();
        bytes[10] ^= 0x01;
        let tampered = format!("0x{}", hex::encode(bytes));

        assert!(matches!(
            verifier.verify_login(&message, &tampered),
            Err(AuthError::InvalidSignature)
        ));
        // a failed signature does not burn the nonce
        assert!(db.get_nonce("n").unwrap().is_some());
    }

    #[test]
    fn message_address_must_match_signer() {
        let (db, verifier) = verifier();
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();
        db.insert_nonce("n", Utc::now() + Duration::minutes(15)).unwrap();

        let message = message_for(&other.address().to_string(), "n");
        assert!(matches!(
            verifier.verify_login(&message, &sign(&signer, &message)),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn unknown_nonce_is_rejected() {
        let (_db, verifier) = verifier();
        let signer = PrivateKeySigner::random();
        let message = message_for(&signer.address().to_string(), "never-issued");
        assert!(matches!(
            verifier.verify_login(&message, &sign(&signer, &message)),
            Err(AuthError::InvalidNonce)
        ));
    }

    #[test]
    fn domain_is_checked_when_configured() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sessions = SessionManager::new(db.clone(), SessionPolicy::default());
        let verifier = SiweVerifier::new(db.clone(), sessions, Some("evil.example".into()));
        let signer = PrivateKeySigner::random();
        db.insert_nonce("n", Utc::now() + Duration::minutes(15)).unwrap();

        let message = message_for(&signer.address().to_string(), "n");
        assert!(matches!(
            verifier.verify_login(&message, &sign(&signer, &message)),
            Err(AuthError::InvalidSignature)
        ));
    }
}
