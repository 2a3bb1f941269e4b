//! JSON-RPC access to configured EVM chains.
//!
//! Each chain gets a primary HTTP endpoint and an optional fallback. Every
//! attempt runs under the configured per-attempt timeout; a transport or
//! JSON-RPC failure on the primary is retried once on the fallback, so a
//! call costs at most two timeout windows. The client only issues the
//! read-only `eth_call`s the rule engine needs and holds no signers.

use alloy_primitives::{Address, Bytes, TxKind};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{TransactionInput, TransactionRequest};
use alloy_transport::TransportError;
use alloy_transport_http::Http;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::metrics::Metrics;

/// Errors surfaced by [`ChainClient::eth_call`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No provider is configured for the requested chain.
    #[error("no RPC endpoint configured for chain {0}")]
    UnknownChain(u64),
    /// Every configured endpoint timed out.
    #[error("RPC call timed out on chain {0}")]
    Timeout(u64),
    /// Every configured endpoint failed; carries the last transport error.
    #[error("RPC call failed on chain {chain_id}: {message}")]
    Transport { chain_id: u64, message: String },
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }
}

struct ChainEndpoints {
    primary: RootProvider,
    fallback: Option<RootProvider>,
}

/// Read-only JSON-RPC client over the configured chains.
pub struct ChainClient {
    chains: HashMap<u64, ChainEndpoints>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl ChainClient {
    pub fn new(timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            chains: HashMap::new(),
            timeout,
            metrics,
        }
    }

    /// Registers endpoints for a chain.
    pub fn add_chain(&mut self, chain_id: u64, primary: Url, fallback: Option<Url>) {
        tracing::info!(chain_id, primary = %primary, has_fallback = fallback.is_some(), "Registered RPC endpoints");
        self.chains.insert(
            chain_id,
            ChainEndpoints {
                primary: connect(primary),
                fallback: fallback.map(connect),
            },
        );
    }

    /// Chain ids with at least one configured endpoint.
    pub fn configured_chains(&self) -> Vec<u64> {
        self.chains.keys().copied().collect()
    }

    pub fn has_chain(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    /// Executes `eth_call` against `contract` with ABI-encoded `data`.
    ///
    /// Returns the raw result bytes; decoding belongs to the caller.
    pub async fn eth_call(
        &self,
        chain_id: u64,
        contract: Address,
        data: Bytes,
    ) -> Result<Bytes, RpcError> {
        let endpoints = self
            .chains
            .get(&chain_id)
            .ok_or(RpcError::UnknownChain(chain_id))?;
        let tx = TransactionRequest {
            to: Some(TxKind::Call(contract)),
            input: TransactionInput::new(data),
            ..Default::default()
        };

        match self.attempt(chain_id, &endpoints.primary, tx.clone()).await {
            Ok(bytes) => Ok(bytes),
            Err(primary_error) => {
                let Some(fallback) = &endpoints.fallback else {
                    return Err(primary_error);
                };
                tracing::warn!(
                    chain_id,
                    error = %primary_error,
                    "Primary RPC failed, retrying on fallback"
                );
                self.attempt(chain_id, fallback, tx).await
            }
        }
    }

    async fn attempt(
        &self,
        chain_id: u64,
        provider: &RootProvider,
        tx: TransactionRequest,
    ) -> Result<Bytes, RpcError> {
        let chain_label = chain_id.to_string();
        let call = provider.call(tx).into_future();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(bytes)) => {
                self.metrics
                    .rpc_calls
                    .with_label_values(&[chain_label.as_str(), "ok"])
                    .inc();
                Ok(bytes)
            }
            Ok(Err(err)) => {
                let err: TransportError = err;
                self.metrics
                    .rpc_calls
                    .with_label_values(&[chain_label.as_str(), "error"])
                    .inc();
                Err(RpcError::Transport {
                    chain_id,
                    message: err.to_string(),
                })
            }
            Err(_elapsed) => {
                self.metrics
                    .rpc_calls
                    .with_label_values(&[chain_label.as_str(), "timeout"])
                    .inc();
                self.metrics.rpc_timeouts.with_label_values(&[chain_label.as_str()]).inc();
                Err(RpcError::Timeout(chain_id))
            }
        }
    }
}

fn connect(url: Url) -> RootProvider {
    let transport = Http::new(url);
    let client = RpcClient::new(transport, false);
    RootProvider::new(client)
}
