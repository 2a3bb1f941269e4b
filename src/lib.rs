//! Gatekeeper: a wallet-native authentication and authorization gateway.
//!
//! Gatekeeper issues bearer sessions to holders of Ethereum-style key pairs
//! via Sign-In With Ethereum (EIP-4361), issues scoped API keys bound to
//! those identities, and guards HTTP routes with a declarative policy engine
//! whose rules can read on-chain state (ERC-20 balances, ERC-721 ownership)
//! and off-chain state (scopes, allowlists). A route is admitted only when
//! every attached policy evaluates to allow under the caller's proven
//! identity.
//!
//! # Request pipeline
//!
//! Rate limit → authentication (bearer → claims) → authorization (route →
//! policies → decision) → handler. Chain reads behind policy rules go
//! through a TTL cache with per-key single-flight so a burst of identical
//! questions costs one RPC call. Rule evaluation is fail-closed: upstream
//! failures deny, they never 500.
//!
//! # Modules
//!
//! - [`address`] — EIP-55 address codec; the single admission gate for addresses.
//! - [`nonce`] — single-use SIWE challenge nonces with TTL.
//! - [`token`] — stateless HS256 session tokens with secret rotation.
//! - [`siwe`] — EIP-4361 parsing and EIP-191 signature recovery.
//! - [`store`] — PostgreSQL identity and API-key stores.
//! - [`cache`] — TTL cache with per-key single-flight loads.
//! - [`rpc`] — JSON-RPC client with primary/fallback endpoints.
//! - [`rules`] — the policy rule engine (scope, allowlist, ERC-20, ERC-721).
//! - [`policy`] — policy configuration loading and the route registry.
//! - [`middleware`] — the tower layers: deadline, rate limit, auth, authz.
//! - [`handlers`] — the HTTP surface.
//! - [`audit`] — structured audit event sink.
//! - [`metrics`] — Prometheus instrumentation.
//! - [`config`] — environment configuration.
//! - [`errors`] — the `{error, details?}` response envelope.
//! - [`telemetry`] — tracing subscriber bootstrap.
//! - [`sig_down`] — graceful shutdown and reload signals.

pub mod address;
pub mod audit;
pub mod cache;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod nonce;
pub mod policy;
pub mod rpc;
pub mod rules;
pub mod sig_down;
pub mod siwe;
pub mod store;
pub mod telemetry;
pub mod token;
