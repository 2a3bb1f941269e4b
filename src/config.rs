//! Environment-driven configuration for the gateway.
//!
//! All tunables arrive through environment variables; the policy document
//! path additionally accepts a `--policies` CLI flag. Values fall back to
//! the defaults in [`config_defaults`]. The JWT secret is validated for
//! length at load time and never logged.

use clap::Parser;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// CLI arguments for the gatekeeper server.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(about = "Wallet-native authentication and authorization gateway")]
struct CliArgs {
    /// Path to the JSON policy configuration file
    #[arg(long, short, env = "POLICY_CONFIG", default_value = "policies.json")]
    policies: PathBuf,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {0} has invalid value {1:?}")]
    Invalid(&'static str, String),
    #[error("JWT_SECRET must be at least 32 bytes")]
    WeakSecret,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: IpAddr,
    pub database_url: String,
    /// Session-token signing secret; never logged.
    pub jwt_secret: String,
    /// Previous secret, still accepted for verification during rotation.
    pub jwt_secret_previous: Option<String>,
    /// Scopes granted to freshly minted session tokens.
    pub session_scopes: Vec<String>,
    pub session_ttl: Duration,
    pub nonce_ttl: Duration,
    pub cache_ttl: Duration,
    pub rpc_timeout: Duration,
    pub ethereum_rpc: Option<Url>,
    pub ethereum_rpc_fallback: Option<Url>,
    /// Default chain id for rules without an explicit one.
    pub chain_id: u64,
    pub db_max_open: u32,
    pub db_max_idle: u32,
    pub db_conn_max_lifetime: Duration,
    pub db_conn_max_idle_time: Duration,
    pub db_timeout: Duration,
    /// API-key creation bucket: tokens per hour and burst.
    pub api_key_creation_rate_limit: u32,
    pub api_key_creation_burst_limit: u32,
    /// General traffic bucket: tokens per minute and burst.
    pub api_usage_rate_limit: u32,
    pub api_usage_burst_limit: u32,
    /// Optional SIWE domain/URI binding.
    pub siwe_domain: Option<String>,
    pub siwe_uri: Option<Url>,
    /// Whether `X-Forwarded-For` / `X-Real-IP` are trusted for rate keying.
    pub trust_proxy: bool,
    pub request_timeout: Duration,
    pub log_level: String,
    pub policies_path: PathBuf,
}

pub mod config_defaults {
    pub const PORT: u16 = 8080;
    pub const HOST: &str = "0.0.0.0";
    pub const NONCE_TTL_MINUTES: u64 = 5;
    pub const JWT_EXPIRY_HOURS: u64 = 1;
    pub const CACHE_TTL_SECONDS: u64 = 300;
    pub const RPC_TIMEOUT_SECONDS: u64 = 5;
    pub const CHAIN_ID: u64 = 1;
    pub const DB_MAX_OPEN_CONNS: u32 = 25;
    pub const DB_MAX_IDLE_CONNS: u32 = 5;
    pub const DB_CONN_MAX_LIFETIME_MINUTES: u64 = 5;
    pub const DB_CONN_MAX_IDLE_TIME_MINUTES: u64 = 1;
    pub const DB_TIMEOUT_SECONDS: u64 = 3;
    pub const API_KEY_CREATION_RATE_LIMIT: u32 = 10;
    pub const API_KEY_CREATION_BURST_LIMIT: u32 = 3;
    pub const API_USAGE_RATE_LIMIT: u32 = 1000;
    pub const API_USAGE_BURST_LIMIT: u32 = 100;
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
    pub const LOG_LEVEL: &str = "info";
}

impl Config {
    /// Parses CLI arguments and resolves the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::from_env(cli_args.policies)
    }

    /// Resolves configuration from environment variables only.
    pub fn from_env(policies_path: PathBuf) -> Result<Self, ConfigError> {
        let jwt_secret = require("JWT_SECRET")?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::WeakSecret);
        }

        Ok(Self {
            port: parse_or("PORT", config_defaults::PORT)?,
            host: parse_or(
                "HOST",
                config_defaults::HOST
                    .parse::<IpAddr>()
                    .expect("default host is a valid address"),
            )?,
            database_url: require("DATABASE_URL")?,
            jwt_secret,
            jwt_secret_previous: optional("JWT_SECRET_PREVIOUS"),
            session_scopes: optional("SESSION_SCOPES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            session_ttl: Duration::from_secs(
                parse_or("JWT_EXPIRY_HOURS", config_defaults::JWT_EXPIRY_HOURS)? * 3600,
            ),
            nonce_ttl: Duration::from_secs(
                parse_or("NONCE_TTL_MINUTES", config_defaults::NONCE_TTL_MINUTES)? * 60,
            ),
            cache_ttl: Duration::from_secs(parse_or(
                "CACHE_TTL",
                config_defaults::CACHE_TTL_SECONDS,
            )?),
            rpc_timeout: Duration::from_secs(parse_or(
                "RPC_TIMEOUT",
                config_defaults::RPC_TIMEOUT_SECONDS,
            )?),
            ethereum_rpc: parse_optional("ETHEREUM_RPC")?,
            ethereum_rpc_fallback: parse_optional("ETHEREUM_RPC_FALLBACK")?,
            chain_id: parse_or("CHAIN_ID", config_defaults::CHAIN_ID)?,
            db_max_open: parse_or("DB_MAX_OPEN_CONNS", config_defaults::DB_MAX_OPEN_CONNS)?,
            db_max_idle: parse_or("DB_MAX_IDLE_CONNS", config_defaults::DB_MAX_IDLE_CONNS)?,
            db_conn_max_lifetime: Duration::from_secs(
                parse_or(
                    "DB_CONN_MAX_LIFETIME_MINUTES",
                    config_defaults::DB_CONN_MAX_LIFETIME_MINUTES,
                )? * 60,
            ),
            db_conn_max_idle_time: Duration::from_secs(
                parse_or(
                    "DB_CONN_MAX_IDLE_TIME_MINUTES",
                    config_defaults::DB_CONN_MAX_IDLE_TIME_MINUTES,
                )? * 60,
            ),
            db_timeout: Duration::from_secs(parse_or(
                "DB_TIMEOUT",
                config_defaults::DB_TIMEOUT_SECONDS,
            )?),
            api_key_creation_rate_limit: parse_or(
                "API_KEY_CREATION_RATE_LIMIT",
                config_defaults::API_KEY_CREATION_RATE_LIMIT,
            )?,
            api_key_creation_burst_limit: parse_or(
                "API_KEY_CREATION_BURST_LIMIT",
                config_defaults::API_KEY_CREATION_BURST_LIMIT,
            )?,
            api_usage_rate_limit: parse_or(
                "API_USAGE_RATE_LIMIT",
                config_defaults::API_USAGE_RATE_LIMIT,
            )?,
            api_usage_burst_limit: parse_or(
                "API_USAGE_BURST_LIMIT",
                config_defaults::API_USAGE_BURST_LIMIT,
            )?,
            siwe_domain: optional("SIWE_DOMAIN"),
            siwe_uri: parse_optional("SIWE_URI")?,
            trust_proxy: parse_or("TRUST_PROXY", true)?,
            request_timeout: Duration::from_secs(parse_or(
                "REQUEST_TIMEOUT",
                config_defaults::REQUEST_TIMEOUT_SECONDS,
            )?),
            log_level: optional("LOG_LEVEL")
                .unwrap_or_else(|| config_defaults::LOG_LEVEL.to_string()),
            policies_path,
        })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

fn parse_optional<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    optional(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid(key, raw))
        })
        .transpose()
}
