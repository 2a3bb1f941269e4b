//! On-chain reads used by the rule engine.
//!
//! The [`ChainReader`] trait is the seam between rule evaluation and
//! JSON-RPC: rules ask typed questions (`balanceOf`, `ownerOf`), the EVM
//! implementation ABI-encodes them, dispatches through [`ChainClient`], and
//! decodes the raw result. Tests substitute a mock reader behind the trait.

use alloy_primitives::{Address, U256};
use alloy_sol_types::{SolCall, sol};
use async_trait::async_trait;
use std::sync::Arc;

use crate::cache::CacheLoadError;
use crate::rpc::{ChainClient, RpcError};

sol! {
    function balanceOf(address owner) external view returns (uint256);
    function ownerOf(uint256 tokenId) external view returns (address);
}

/// Errors produced while reading chain state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainReadError {
    /// The RPC attempt(s) timed out.
    #[error("chain read timed out")]
    Timeout,
    /// Transport or JSON-RPC failure, including reverts.
    #[error("chain read failed: {0}")]
    Upstream(String),
    /// The call returned bytes that do not decode as the expected type.
    #[error("chain read returned undecodable data: {0}")]
    Decode(String),
}

impl From<RpcError> for ChainReadError {
    fn from(err: RpcError) -> Self {
        if err.is_timeout() {
            ChainReadError::Timeout
        } else {
            ChainReadError::Upstream(err.to_string())
        }
    }
}

impl From<ChainReadError> for CacheLoadError {
    fn from(err: ChainReadError) -> Self {
        match err {
            ChainReadError::Timeout => CacheLoadError::Timeout,
            other => CacheLoadError::Upstream(other.to_string()),
        }
    }
}

/// Typed read-only contract queries.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// ERC-20 `balanceOf(owner)` on `contract` at `chain_id`.
    async fn erc20_balance_of(
        &self,
        chain_id: u64,
        contract: Address,
        owner: Address,
    ) -> Result<U256, ChainReadError>;

    /// ERC-721 `ownerOf(token_id)` on `contract` at `chain_id`.
    ///
    /// Returns the zero address when the contract reports no owner that way;
    /// contracts that revert instead surface as [`ChainReadError::Upstream`].
    async fn erc721_owner_of(
        &self,
        chain_id: u64,
        contract: Address,
        token_id: U256,
    ) -> Result<Address, ChainReadError>;
}

/// [`ChainReader`] over the JSON-RPC client.
pub struct EvmChainReader {
    client: Arc<ChainClient>,
}

impl EvmChainReader {
    pub fn new(client: Arc<ChainClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChainReader for EvmChainReader {
    async fn erc20_balance_of(
        &self,
        chain_id: u64,
        contract: Address,
        owner: Address,
    ) -> Result<U256, ChainReadError> {
        let data = balanceOfCall { owner }.abi_encode();
        let bytes = self.client.eth_call(chain_id, contract, data.into()).await?;
        balanceOfCall::abi_decode_returns(&bytes)
            .map_err(|err| ChainReadError::Decode(err.to_string()))
    }

    async fn erc721_owner_of(
        &self,
        chain_id: u64,
        contract: Address,
        token_id: U256,
    ) -> Result<Address, ChainReadError> {
        let data = ownerOfCall { tokenId: token_id }.abi_encode();
        let bytes = self.client.eth_call(chain_id, contract, data.into()).await?;
        ownerOfCall::abi_decode_returns(&bytes)
            .map_err(|err| ChainReadError::Decode(err.to_string()))
    }
}
