//! The request middleware chain.
//!
//! Order, outermost first: request deadline → rate limit → authentication →
//! authorization → handler. Each middleware is a `tower` layer wrapping a
//! boxed clone of the inner service. Authentication attaches [`Claims`] to
//! the request extensions and never rejects on its own; authorization and
//! the handlers decide what an absent or failed credential means for them.

pub mod auth;
pub mod authz;
pub mod deadline;
pub mod rate_limit;

use alloy_primitives::Address;
use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::address;

/// Which credential produced the claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    SessionToken,
    ApiKey,
}

impl CredentialKind {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialKind::SessionToken => "session_token",
            CredentialKind::ApiKey => "api_key",
        }
    }
}

/// Proven identity attached to the request by the auth middleware.
#[derive(Debug, Clone)]
pub struct Claims {
    /// Normalized caller address.
    pub address: Address,
    pub scopes: Vec<String>,
    pub credential: CredentialKind,
    /// Known for API-key credentials; resolved lazily for sessions.
    pub user_id: Option<Uuid>,
    /// Set when the credential was an API key.
    pub key_id: Option<Uuid>,
}

impl Claims {
    /// Lowercase canonical address for storage and audit records.
    pub fn canonical_address(&self) -> String {
        address::canonical(&self.address)
    }
}

/// Why a presented credential was rejected.
///
/// Attached to the request when authentication fails, so downstream
/// components can answer 401 with the right public error kind while the
/// specific cause stays in the audit stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Malformed, unknown, expired, or revoked API key.
    InvalidApiKey,
    /// Bad tag, malformed, or expired session token.
    InvalidToken,
    /// Infrastructure failure while validating; surfaces as 500.
    Internal,
}

impl AuthFailure {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthFailure::InvalidApiKey => "invalid_api_key",
            AuthFailure::InvalidToken => "invalid_token",
            AuthFailure::Internal => "internal",
        }
    }
}

/// Best-effort client address for rate keying and audit records.
///
/// Forwarded headers are consulted only when the deployment trusts its
/// proxy; otherwise the socket peer address is used.
pub fn client_addr(
    headers: &HeaderMap,
    extensions: &Extensions,
    trust_proxy: bool,
) -> Option<String> {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(addr) = forwarded {
            return Some(addr.to_string());
        }
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(addr) = real_ip {
            return Some(addr.to_string());
        }
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}
