//! Stateless session tokens.
//!
//! A session token is an HS256 JWT over `{sub, scopes, iat, exp, iss}`. Any
//! modification of the claims invalidates the tag, and expiry is enforced on
//! verification with zero leeway. There is no revocation list: logout is
//! client-side, and short TTLs bound exposure.
//!
//! Verification accepts an ordered set of secrets (current first, then the
//! previous one during rotation); generation always uses the current secret.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Issuer claim stamped into every session token.
pub const ISSUER: &str = "gatekeeper";

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Canonical (lowercase) address of the authenticated wallet.
    pub sub: String,
    /// Capability scopes granted to this session.
    pub scopes: Vec<String>,
    /// Issue time, seconds since the Unix epoch.
    pub iat: u64,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    pub iss: String,
}

/// Errors surfaced by token generation and verification.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token is expired.
    #[error("session token expired")]
    Expired,
    /// Bad tag, malformed structure, wrong algorithm, or wrong issuer.
    #[error("invalid session token")]
    Invalid,
    /// System clock unavailable while stamping claims.
    #[error("system clock error")]
    Clock,
    /// Encoding failure (never expected with HS256 and valid claims).
    #[error("failed to encode session token")]
    Encode,
}

/// Mints and verifies session tokens with a rotating secret set.
pub struct SessionSigner {
    ttl: Duration,
    encoding: EncodingKey,
    decoding: Vec<DecodingKey>,
    validation: Validation,
}

impl SessionSigner {
    /// Builds a signer from the current secret and an optional previous
    /// secret still accepted for verification.
    pub fn new(secret: &[u8], previous: Option<&[u8]>, ttl: Duration) -> Self {
        let mut decoding = vec![DecodingKey::from_secret(secret)];
        if let Some(previous) = previous {
            decoding.push(DecodingKey::from_secret(previous));
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.leeway = 0;
        Self {
            ttl,
            encoding: EncodingKey::from_secret(secret),
            decoding,
            validation,
        }
    }

    /// Session lifetime applied to generated tokens.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mints a token for `address` carrying `scopes`.
    ///
    /// Returns the encoded token together with its expiry window in seconds.
    pub fn generate(&self, address: &str, scopes: &[String]) -> Result<(String, u64), TokenError> {
        let now = unix_now()?;
        let expires_in = self.ttl.as_secs();
        let claims = SessionClaims {
            sub: address.to_string(),
            scopes: scopes.to_vec(),
            iat: now,
            exp: now + expires_in,
            iss: ISSUER.to_string(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| TokenError::Encode)?;
        Ok((token, expires_in))
    }

    /// Verifies a token against every accepted secret, newest first.
    ///
    /// Rejects on tag mismatch, expiry, unknown algorithm, or wrong issuer.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let mut last_error = TokenError::Invalid;
        for key in &self.decoding {
            match jsonwebtoken::decode::<SessionClaims>(token, key, &self.validation) {
                Ok(data) => return Ok(data.claims),
                Err(err) => {
                    last_error = match err.kind() {
                        jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                        _ => TokenError::Invalid,
                    };
                }
            }
        }
        Err(last_error)
    }
}

/// Current time in seconds since the Unix epoch.
pub fn unix_now() -> Result<u64, TokenError> {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| TokenError::Clock)
}
