//! EIP-4361 (Sign-In With Ethereum) message parsing and signature recovery.
//!
//! A SIWE message is a line-oriented text document signed by a wallet over
//! the EIP-191 prefixed digest. [`SiweMessage::parse`] extracts and checks
//! the structural fields; [`SiweVerifier::verify`] binds the 65-byte
//! `r ‖ s ‖ v` signature to the address declared in the message by
//! recovering the secp256k1 public key from the digest.
//!
//! Nonce consumption is deliberately not handled here: the caller consumes
//! the nonce through the nonce store before committing a successful
//! verification, so a failed signature still burns its nonce.

use alloy_primitives::{Address, Signature, eip191_hash_message};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use url::Url;

use crate::address::{self, AddressError};

const DOMAIN_SUFFIX: &str = " wants you to sign in with your Ethereum account:";

/// Errors produced during SIWE parsing and verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SiweError {
    /// Structural failure: missing line, missing field, or bad field syntax.
    #[error("malformed SIWE message: {0}")]
    MalformedMessage(&'static str),
    /// The address line failed EIP-55 admission.
    #[error("invalid address in SIWE message: {0}")]
    InvalidAddress(#[from] AddressError),
    /// The message carries an `Expiration Time` in the past.
    #[error("SIWE message expired")]
    Expired,
    /// Signature bytes malformed, recovery failed, or the recovered address
    /// does not match the message address.
    #[error("invalid SIWE signature")]
    InvalidSignature,
    /// The message domain or URI does not match the configured binding.
    #[error("SIWE domain or URI mismatch")]
    DomainMismatch,
}

/// The verified fields of an EIP-4361 message.
#[derive(Debug, Clone, PartialEq)]
pub struct SiweMessage {
    pub domain: String,
    /// Normalized signer address declared by the message.
    pub address: Address,
    pub statement: Option<String>,
    pub uri: String,
    pub chain_id: u64,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl SiweMessage {
    /// Parses the line format mandated by EIP-4361.
    ///
    /// Required fields: domain line, address, `URI`, `Version` (must be
    /// `"1"`), `Chain ID`, `Nonce`, `Issued At`. `Expiration Time` and the
    /// statement block are optional.
    pub fn parse(message: &str) -> Result<Self, SiweError> {
        let mut lines = message.lines();

        let header = lines
            .next()
            .ok_or(SiweError::MalformedMessage("empty message"))?;
        let domain = header
            .strip_suffix(DOMAIN_SUFFIX)
            .ok_or(SiweError::MalformedMessage("missing domain line"))?
            .trim()
            .to_string();
        if domain.is_empty() {
            return Err(SiweError::MalformedMessage("empty domain"));
        }

        let address_line = lines
            .next()
            .ok_or(SiweError::MalformedMessage("missing address line"))?
            .trim();
        let address = address::normalize(address_line)?;

        // A single blank line separates the address from the optional
        // statement block.
        match lines.next() {
            Some(line) if line.trim().is_empty() => {}
            Some(_) => return Err(SiweError::MalformedMessage("expected blank separator")),
            None => return Err(SiweError::MalformedMessage("truncated message")),
        }

        let mut statement_lines = Vec::new();
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
            statement_lines.push(line.trim_end_matches('\r'));
        }
        let statement = if statement_lines.is_empty() {
            None
        } else {
            Some(statement_lines.join("\n"))
        };

        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim(), value.trim());
            }
        }

        let version = fields
            .get("Version")
            .ok_or(SiweError::MalformedMessage("missing Version"))?;
        if version.trim() != "1" {
            return Err(SiweError::MalformedMessage("unsupported version"));
        }
        let uri = fields
            .get("URI")
            .ok_or(SiweError::MalformedMessage("missing URI"))?
            .to_string();
        let chain_id = fields
            .get("Chain ID")
            .ok_or(SiweError::MalformedMessage("missing Chain ID"))?
            .parse::<u64>()
            .map_err(|_| SiweError::MalformedMessage("invalid Chain ID"))?;
        let nonce = fields
            .get("Nonce")
            .ok_or(SiweError::MalformedMessage("missing Nonce"))?
            .to_string();
        if nonce.is_empty() {
            return Err(SiweError::MalformedMessage("empty Nonce"));
        }
        let issued_at = fields
            .get("Issued At")
            .ok_or(SiweError::MalformedMessage("missing Issued At"))
            .and_then(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| SiweError::MalformedMessage("invalid Issued At"))
            })?
            .with_timezone(&Utc);
        let expiration_time = fields
            .get("Expiration Time")
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| SiweError::MalformedMessage("invalid Expiration Time"))
            })
            .transpose()?;

        Ok(Self {
            domain,
            address,
            statement,
            uri,
            chain_id,
            nonce,
            issued_at,
            expiration_time,
        })
    }
}

/// Signature verification plus optional domain/URI binding.
#[derive(Debug, Clone, Default)]
pub struct SiweVerifier {
    expected_domain: Option<String>,
    expected_uri: Option<Url>,
}

impl SiweVerifier {
    pub fn new(expected_domain: Option<String>, expected_uri: Option<Url>) -> Self {
        Self {
            expected_domain,
            expected_uri,
        }
    }

    /// Rejects messages whose domain or URI deviate from the configured
    /// expectations. A missing expectation binds nothing.
    pub fn check_binding(&self, message: &SiweMessage) -> Result<(), SiweError> {
        if let Some(expected) = &self.expected_domain
            && !message.domain.eq_ignore_ascii_case(expected)
        {
            return Err(SiweError::DomainMismatch);
        }
        if let Some(expected) = &self.expected_uri {
            let uri = Url::parse(&message.uri).map_err(|_| SiweError::DomainMismatch)?;
            if uri != *expected {
                return Err(SiweError::DomainMismatch);
            }
        }
        Ok(())
    }

    /// Rejects messages whose `Expiration Time` has passed.
    pub fn check_expiry(&self, message: &SiweMessage, now: DateTime<Utc>) -> Result<(), SiweError> {
        if let Some(expiration) = message.expiration_time
            && expiration <= now
        {
            return Err(SiweError::Expired);
        }
        Ok(())
    }

    /// Recovers the signer from the EIP-191 digest of `raw_message` and
    /// requires it to match the address declared in the parsed message.
    pub fn verify_signature(
        &self,
        message: &SiweMessage,
        raw_message: &str,
        signature: &str,
    ) -> Result<Address, SiweError> {
        let stripped = signature.trim().trim_start_matches("0x");
        let bytes = hex::decode(stripped).map_err(|_| SiweError::InvalidSignature)?;
        let bytes: [u8; 65] = bytes.try_into().map_err(|_| SiweError::InvalidSignature)?;
        let signature =
            Signature::from_raw_array(&bytes).map_err(|_| SiweError::InvalidSignature)?;
        let digest = eip191_hash_message(raw_message.as_bytes());
        let recovered = signature
            .recover_address_from_prehash(&digest)
            .map_err(|_| SiweError::InvalidSignature)?;
        if recovered != message.address {
            return Err(SiweError::InvalidSignature);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{B256, keccak256};
    use self::k256_signing::sign_prehash_recoverable;

    const ADDRESS: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    const NONCE: &str = "3299fc077a123060ec462faa24375dc4";

    fn sample_message() -> String {
        format!(
            "example.com wants you to sign in with your Ethereum account:\n\
             {ADDRESS}\n\
             \n\
             Sign in to Gatekeeper\n\
             \n\
             URI: https://example.com\n\
             Version: 1\n\
             Chain ID: 1\n\
             Nonce: {NONCE}\n\
             Issued At: 2026-01-01T00:00:00Z"
        )
    }

    #[test]
    fn parses_all_fields() {
        let parsed = SiweMessage::parse(&sample_message()).expect("parse");
        assert_eq!(parsed.domain, "example.com");
        assert_eq!(crate::address::checksum(&parsed.address), ADDRESS);
        assert_eq!(parsed.statement.as_deref(), Some("Sign in to Gatekeeper"));
        assert_eq!(parsed.uri, "https://example.com");
        assert_eq!(parsed.chain_id, 1);
        assert_eq!(parsed.nonce, NONCE);
        assert!(parsed.expiration_time.is_none());
    }

    #[test]
    fn rejects_missing_nonce() {
        let message = sample_message().replace(&format!("Nonce: {NONCE}\n"), "");
        assert_eq!(
            SiweMessage::parse(&message),
            Err(SiweError::MalformedMessage("missing Nonce"))
        );
    }

    #[test]
    fn rejects_unsupported_version() {
        let message = sample_message().replace("Version: 1", "Version: 2");
        assert_eq!(
            SiweMessage::parse(&message),
            Err(SiweError::MalformedMessage("unsupported version"))
        );
    }

    #[test]
    fn rejects_bad_checksum_address() {
        let message = sample_message().replace(ADDRESS, "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAeD");
        assert!(matches!(
            SiweMessage::parse(&message),
            Err(SiweError::InvalidAddress(_))
        ));
    }

    #[test]
    fn parses_optional_expiration_time() {
        let message = format!("{}\nExpiration Time: 2026-01-01T01:00:00Z", sample_message());
        let parsed = SiweMessage::parse(&message).expect("parse");
        assert!(parsed.expiration_time.is_some());

        let verifier = SiweVerifier::default();
        let before = "2026-01-01T00:30:00Z".parse().expect("timestamp");
        let after = "2026-01-01T02:00:00Z".parse().expect("timestamp");
        assert_eq!(verifier.check_expiry(&parsed, before), Ok(()));
        assert_eq!(verifier.check_expiry(&parsed, after), Err(SiweError::Expired));
    }

    #[test]
    fn domain_binding_rejects_mismatch() {
        let parsed = SiweMessage::parse(&sample_message()).expect("parse");
        let bound = SiweVerifier::new(Some("example.com".to_string()), None);
        assert_eq!(bound.check_binding(&parsed), Ok(()));
        let other = SiweVerifier::new(Some("other.example".to_string()), None);
        assert_eq!(other.check_binding(&parsed), Err(SiweError::DomainMismatch));
    }

    #[test]
    fn recovers_signer_from_valid_signature() {
        let (secret, address) = test_key(1);
        let message = sample_message().replace(ADDRESS, &crate::address::checksum(&address));
        let parsed = SiweMessage::parse(&message).expect("parse");

        let digest = eip191_hash_message(message.as_bytes());
        let signature = sign_prehash_recoverable(&secret, &digest);

        let verifier = SiweVerifier::default();
        let recovered = verifier
            .verify_signature(&parsed, &message, &signature)
            .expect("signature verifies");
        assert_eq!(recovered, address);
    }

    #[test]
    fn rejects_signature_from_other_key() {
        let (_, address) = test_key(1);
        let (other_secret, _) = test_key(2);
        let message = sample_message().replace(ADDRESS, &crate::address::checksum(&address));
        let parsed = SiweMessage::parse(&message).expect("parse");

        let digest = eip191_hash_message(message.as_bytes());
        let signature = sign_prehash_recoverable(&other_secret, &digest);

        let verifier = SiweVerifier::default();
        assert_eq!(
            verifier.verify_signature(&parsed, &message, &signature),
            Err(SiweError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_malformed_signature_bytes() {
        let parsed = SiweMessage::parse(&sample_message()).expect("parse");
        let verifier = SiweVerifier::default();
        assert_eq!(
            verifier.verify_signature(&parsed, &sample_message(), "0xdeadbeef"),
            Err(SiweError::InvalidSignature)
        );
    }

    /// Deterministic secp256k1 test key and its derived address.
    fn test_key(index: u8) -> (B256, Address) {
        use k256::ecdsa::SigningKey;

        let mut seed = [0u8; 32];
        seed[31] = index;
        let signing_key = SigningKey::from_bytes(&seed.into()).expect("valid scalar");
        let verifying_key = signing_key.verifying_key();
        let encoded = verifying_key.to_encoded_point(false);
        let hash = keccak256(&encoded.as_bytes()[1..]);
        let address = Address::from_slice(&hash[12..]);
        (B256::from(seed), address)
    }

    /// Produces a 65-byte `r ‖ s ‖ v` hex signature over a prehash.
    mod k256_signing {
        use alloy_primitives::B256;
        use k256::ecdsa::SigningKey;

        pub fn sign_prehash_recoverable(secret: &B256, digest: &B256) -> String {
            let signing_key = SigningKey::from_bytes(secret.as_slice().into()).expect("valid key");
            let (signature, recovery_id) = signing_key
                .sign_prehash_recoverable(digest.as_slice())
                .expect("sign");
            let mut bytes = [0u8; 65];
            bytes[..64].copy_from_slice(&signature.to_bytes());
            bytes[64] = 27 + recovery_id.to_byte();
            format!("0x{}", hex::encode(bytes))
        }
    }
}
