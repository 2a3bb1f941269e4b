//! Gatekeeper HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server exposing the SIWE sign-in
//! flow, the API-key management endpoints, and the policy-guarded request
//! pipeline.
//!
//! Endpoints:
//! - `GET /auth/siwe/nonce` – Issue a single-use sign-in nonce
//! - `POST /auth/siwe/verify` – Verify a signed EIP-4361 message, mint a session token
//! - `POST /api/keys` / `GET /api/keys` / `DELETE /api/keys/{id}` – API-key management
//! - `GET /health` – Liveness with a bounded database probe
//! - `GET /metrics` – Prometheus text exposition
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `--policies` / `POLICY_CONFIG` select the policy document
//! - SIGHUP reloads policies; SIGTERM/SIGINT drain gracefully

use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use gatekeeper::audit::{AuditAction, AuditEvent, AuditResult, AuditSink};
use gatekeeper::cache::TtlCache;
use gatekeeper::config::Config;
use gatekeeper::handlers::{self, AppState};
use gatekeeper::metrics::Metrics;
use gatekeeper::middleware::auth::{AuthLayer, AuthState};
use gatekeeper::middleware::authz::{AuthzLayer, AuthzState};
use gatekeeper::middleware::deadline::DeadlineLayer;
use gatekeeper::middleware::rate_limit::RateLimitLayer;
use gatekeeper::nonce::NonceStore;
use gatekeeper::policy::{PolicyRegistry, load_policies};
use gatekeeper::rpc::ChainClient;
use gatekeeper::rules::chain::{ChainReader, EvmChainReader};
use gatekeeper::rules::RuleEngine;
use gatekeeper::sig_down::SigDown;
use gatekeeper::siwe::SiweVerifier;
use gatekeeper::store::api_keys::ApiKeyStore;
use gatekeeper::store::users::UserStore;
use gatekeeper::token::SessionSigner;
use gatekeeper::{store, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let config = Config::load()?;
    telemetry::init(&config.log_level);
    let metrics = Arc::new(Metrics::new());

    let pool = store::connect(&config).await?;
    store::migrate(&pool).await?;

    let mut sig_down = SigDown::try_new()?;
    let shutdown = sig_down.cancellation_token();

    let nonces = Arc::new(NonceStore::new(config.nonce_ttl));
    nonces.spawn_sweeper(shutdown.clone());

    let mut chain_client = ChainClient::new(config.rpc_timeout, Arc::clone(&metrics));
    match config.ethereum_rpc.clone() {
        Some(rpc) => {
            chain_client.add_chain(config.chain_id, rpc, config.ethereum_rpc_fallback.clone());
        }
        None => {
            tracing::warn!("ETHEREUM_RPC not set; policies with on-chain rules will fail to load");
        }
    }
    let chain_client = Arc::new(chain_client);
    let reader: Arc<dyn ChainReader> = Arc::new(EvmChainReader::new(Arc::clone(&chain_client)));
    let chain_cache = Arc::new(TtlCache::new(config.cache_ttl));
    chain_cache.spawn_sweeper(shutdown.clone());
    let engine = Arc::new(RuleEngine::new(
        reader,
        Arc::clone(&chain_cache),
        Arc::clone(&metrics),
    ));

    // Policy load errors are fatal at boot; a missing file is an empty table.
    let registry = {
        let chain_known = |chain_id: u64| chain_client.has_chain(chain_id);
        let policies = match tokio::fs::read_to_string(&config.policies_path).await {
            Ok(document) => load_policies(&document, config.chain_id, &chain_known)?,
            Err(err) => {
                tracing::warn!(
                    path = %config.policies_path.display(),
                    error = %err,
                    "Policy document not readable; starting with no policies"
                );
                Vec::new()
            }
        };
        Arc::new(PolicyRegistry::new(policies))
    };
    tracing::info!(
        policies = registry.len(),
        chains = ?chain_client.configured_chains(),
        "Policy registry installed"
    );

    let audit = AuditSink::spawn(Arc::clone(&metrics), shutdown.clone());
    let sessions = Arc::new(SessionSigner::new(
        config.jwt_secret.as_bytes(),
        config.jwt_secret_previous.as_deref().map(str::as_bytes),
        config.session_ttl,
    ));
    let siwe = SiweVerifier::new(config.siwe_domain.clone(), config.siwe_uri.clone());
    let users = UserStore::new(pool.clone(), config.db_timeout);
    let api_keys = ApiKeyStore::new(pool.clone(), config.db_timeout, shutdown.clone());

    // SIGHUP swaps the policy table; a failed reload keeps the old one.
    if let Some(mut reload_rx) = sig_down.take_reload_signal() {
        let registry = Arc::clone(&registry);
        let chain_client = Arc::clone(&chain_client);
        let audit = audit.clone();
        let policies_path = config.policies_path.clone();
        let default_chain = config.chain_id;
        tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                let chain_known = |chain_id: u64| chain_client.has_chain(chain_id);
                let loaded = match tokio::fs::read_to_string(&policies_path).await {
                    Ok(document) => load_policies(&document, default_chain, &chain_known)
                        .map_err(|err| err.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                match loaded {
                    Ok(policies) => {
                        let count = policies.len();
                        registry.reload(policies);
                        tracing::info!(policies = count, "Policy registry reloaded");
                        audit.emit(AuditEvent::new(
                            AuditAction::PolicyReload,
                            AuditResult::Success,
                        ));
                    }
                    Err(reason) => {
                        tracing::warn!(error = %reason, "Policy reload failed; keeping previous table");
                        audit.emit(
                            AuditEvent::new(AuditAction::PolicyReload, AuditResult::Failure)
                                .with_error_code(reason),
                        );
                    }
                }
            }
        });
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        pool,
        nonces,
        sessions: Arc::clone(&sessions),
        siwe,
        users: users.clone(),
        api_keys: api_keys.clone(),
        policies: Arc::clone(&registry),
        audit: audit.clone(),
        metrics: Arc::clone(&metrics),
    });

    let creation_limit = RateLimitLayer::new(
        "api_key_creation",
        config.api_key_creation_rate_limit,
        Duration::from_secs(3600),
        config.api_key_creation_burst_limit,
        config.trust_proxy,
        Arc::clone(&metrics),
    );
    let usage_limit = RateLimitLayer::new(
        "api_usage",
        config.api_usage_rate_limit,
        Duration::from_secs(60),
        config.api_usage_burst_limit,
        config.trust_proxy,
        Arc::clone(&metrics),
    );
    let auth_state = Arc::new(AuthState {
        sessions,
        api_keys,
        users,
        audit: audit.clone(),
        metrics: Arc::clone(&metrics),
        trust_proxy: config.trust_proxy,
    });
    let authz_state = Arc::new(AuthzState {
        registry,
        engine,
        audit,
        metrics: Arc::clone(&metrics),
        trust_proxy: config.trust_proxy,
    });

    // Layer order: the last layer added runs first. Outermost to innermost:
    // trace → cors → deadline → usage limit → auth → authz → routes.
    let http_endpoints = handlers::routes(state, creation_limit)
        .layer(AuthzLayer::new(authz_state))
        .layer(AuthLayer::new(auth_state))
        .layer(usage_limit)
        .layer(DeadlineLayer::new(config.request_timeout, Arc::clone(&metrics)))
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(cors::Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let axum_cancellation_token = shutdown.clone();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(
        listener,
        http_endpoints.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(axum_graceful_shutdown)
    .await?;

    Ok(())
}
