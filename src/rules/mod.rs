//! Policy rule engine.
//!
//! Rules are a closed sum type: scope membership, address allowlists, ERC-20
//! minimum balances, and ERC-721 ownership. Rules arrive from configuration
//! as [`RuleConfig`] and are validated into [`Rule`] at load time; unknown
//! types and malformed parameters never reach request handling.
//!
//! Evaluation is fail-closed: any loader error, timeout, or normalization
//! failure makes the affected rule deny. The error is logged and counted,
//! never propagated; callers see a deny, not a 500.

pub mod chain;

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::address::{self, AddressError};
use crate::cache::TtlCache;
use crate::metrics::Metrics;
use self::chain::ChainReader;

/// How rules within one policy combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    And,
    Or,
}

/// Wire form of a rule, as found in the policy configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleConfig {
    HasScope {
        scope: String,
    },
    InAllowlist {
        addresses: Vec<String>,
    },
    Erc20MinBalance {
        contract_address: String,
        /// Decimal string; arbitrary precision up to 256 bits.
        minimum_balance: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chain_id: Option<u64>,
    },
    Erc721Owner {
        contract_address: String,
        /// Decimal string; arbitrary precision up to 256 bits.
        token_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chain_id: Option<u64>,
    },
}

/// Validation failures for a single rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleValidationError {
    #[error("scope must not be empty")]
    EmptyScope,
    #[error("allowlist must contain at least one address")]
    EmptyAllowlist,
    #[error("invalid address {0:?}: {1}")]
    BadAddress(String, AddressError),
    #[error("invalid decimal amount {0:?}")]
    BadAmount(String),
    #[error("no RPC endpoint configured for chain {0}")]
    UnknownChain(u64),
}

/// A validated rule ready for evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    HasScope {
        scope: String,
    },
    InAllowlist {
        addresses: HashSet<Address>,
    },
    Erc20MinBalance {
        chain_id: u64,
        contract: Address,
        min: U256,
    },
    Erc721Owner {
        chain_id: u64,
        contract: Address,
        token_id: U256,
    },
}

impl RuleConfig {
    /// Validates parameters and resolves the chain id.
    ///
    /// `chain_known` reflects the configured RPC endpoints; a rule that
    /// would always fail-closed at runtime is rejected here instead.
    pub fn validate(
        &self,
        default_chain: u64,
        chain_known: &dyn Fn(u64) -> bool,
    ) -> Result<Rule, RuleValidationError> {
        match self {
            RuleConfig::HasScope { scope } => {
                let scope = scope.trim();
                if scope.is_empty() {
                    return Err(RuleValidationError::EmptyScope);
                }
                Ok(Rule::HasScope {
                    scope: scope.to_string(),
                })
            }
            RuleConfig::InAllowlist { addresses } => {
                if addresses.is_empty() {
                    return Err(RuleValidationError::EmptyAllowlist);
                }
                let mut normalized = HashSet::with_capacity(addresses.len());
                for raw in addresses {
                    let parsed = address::normalize(raw).map_err(|err| {
                        RuleValidationError::BadAddress(raw.clone(), err)
                    })?;
                    normalized.insert(parsed);
                }
                Ok(Rule::InAllowlist {
                    addresses: normalized,
                })
            }
            RuleConfig::Erc20MinBalance {
                contract_address,
                minimum_balance,
                chain_id,
            } => {
                let contract = address::normalize(contract_address).map_err(|err| {
                    RuleValidationError::BadAddress(contract_address.clone(), err)
                })?;
                let min = parse_decimal(minimum_balance)?;
                let chain_id = chain_id.unwrap_or(default_chain);
                if !chain_known(chain_id) {
                    return Err(RuleValidationError::UnknownChain(chain_id));
                }
                Ok(Rule::Erc20MinBalance {
                    chain_id,
                    contract,
                    min,
                })
            }
            RuleConfig::Erc721Owner {
                contract_address,
                token_id,
                chain_id,
            } => {
                let contract = address::normalize(contract_address).map_err(|err| {
                    RuleValidationError::BadAddress(contract_address.clone(), err)
                })?;
                let token_id = parse_decimal(token_id)?;
                let chain_id = chain_id.unwrap_or(default_chain);
                if !chain_known(chain_id) {
                    return Err(RuleValidationError::UnknownChain(chain_id));
                }
                Ok(Rule::Erc721Owner {
                    chain_id,
                    contract,
                    token_id,
                })
            }
        }
    }
}

impl Rule {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Rule::HasScope { .. } => "has_scope",
            Rule::InAllowlist { .. } => "in_allowlist",
            Rule::Erc20MinBalance { .. } => "erc20_min_balance",
            Rule::Erc721Owner { .. } => "erc721_owner",
        }
    }
}

fn parse_decimal(raw: &str) -> Result<U256, RuleValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(RuleValidationError::BadAmount(raw.to_string()));
    }
    U256::from_str_radix(trimmed, 10).map_err(|_| RuleValidationError::BadAmount(raw.to_string()))
}

/// Values kept in the chain-read cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainValue {
    /// ERC-20 decision with the threshold baked into the cache key.
    Decision(bool),
    /// ERC-721 owner; the zero address means "no owner".
    Owner(Address),
}

/// Per-evaluation cache statistics, reported to the audit stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Evaluates validated rules against a caller's proven identity.
pub struct RuleEngine {
    reader: Arc<dyn ChainReader>,
    cache: Arc<TtlCache<ChainValue>>,
    metrics: Arc<Metrics>,
}

impl RuleEngine {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        cache: Arc<TtlCache<ChainValue>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            reader,
            cache,
            metrics,
        }
    }

    /// Combines rule verdicts under the policy's logic, short-circuiting.
    pub async fn evaluate(
        &self,
        logic: Logic,
        rules: &[Rule],
        caller: Address,
        scopes: &[String],
        stats: &mut EvalStats,
    ) -> bool {
        match logic {
            Logic::And => {
                for rule in rules {
                    if !self.evaluate_rule(rule, caller, scopes, stats).await {
                        return false;
                    }
                }
                true
            }
            Logic::Or => {
                for rule in rules {
                    if self.evaluate_rule(rule, caller, scopes, stats).await {
                        return true;
                    }
                }
                false
            }
        }
    }

    async fn evaluate_rule(
        &self,
        rule: &Rule,
        caller: Address,
        scopes: &[String],
        stats: &mut EvalStats,
    ) -> bool {
        let timer = self.metrics.rule_duration.start_timer();
        let allow = match rule {
            Rule::HasScope { scope } => scopes.iter().any(|s| s.trim() == scope),
            Rule::InAllowlist { addresses } => addresses.contains(&caller),
            Rule::Erc20MinBalance {
                chain_id,
                contract,
                min,
            } => {
                let key = format!(
                    "erc20_balance:{}:{}:{}:{}",
                    chain_id,
                    address::canonical(contract),
                    address::canonical(&caller),
                    min
                );
                let reader = Arc::clone(&self.reader);
                let (chain_id, contract, min) = (*chain_id, *contract, *min);
                let loader = async move {
                    let balance = reader.erc20_balance_of(chain_id, contract, caller).await?;
                    Ok(ChainValue::Decision(balance >= min))
                };
                let (result, hit) = self.cache.get_or_load(&key, loader).await;
                self.record_cache(stats, hit);
                match result {
                    Ok(ChainValue::Decision(allow)) => allow,
                    Ok(_) => false,
                    Err(err) => self.deny_on_failure(rule, &err),
                }
            }
            Rule::Erc721Owner {
                chain_id,
                contract,
                token_id,
            } => {
                // Keyed per token, not per caller: the owner is discovered
                // once per TTL no matter how many callers ask.
                let key = format!(
                    "erc721_owner:{}:{}:{}",
                    chain_id,
                    address::canonical(contract),
                    token_id
                );
                let reader = Arc::clone(&self.reader);
                let (chain_id, contract, token_id) = (*chain_id, *contract, *token_id);
                let loader = async move {
                    let owner = reader.erc721_owner_of(chain_id, contract, token_id).await?;
                    Ok(ChainValue::Owner(owner))
                };
                let (result, hit) = self.cache.get_or_load(&key, loader).await;
                self.record_cache(stats, hit);
                match result {
                    Ok(ChainValue::Owner(owner)) => owner != Address::ZERO && owner == caller,
                    Ok(_) => false,
                    Err(err) => self.deny_on_failure(rule, &err),
                }
            }
        };
        timer.observe_duration();
        allow
    }

    /// Records one cache outcome in the per-decision stats and the process
    /// counters exposed at `/metrics`.
    fn record_cache(&self, stats: &mut EvalStats, hit: bool) {
        if hit {
            stats.cache_hits += 1;
            self.metrics.cache_hits.inc();
        } else {
            stats.cache_misses += 1;
            self.metrics.cache_misses.inc();
        }
    }

    /// Converts a loader failure into a deny, logging and counting it.
    fn deny_on_failure(&self, rule: &Rule, err: &crate::cache::CacheLoadError) -> bool {
        let reason = match err {
            crate::cache::CacheLoadError::Timeout => "timeout",
            crate::cache::CacheLoadError::Upstream(_) => "upstream",
        };
        self.metrics
            .rule_failures
            .with_label_values(&[rule.kind(), reason])
            .inc();
        tracing::warn!(rule = rule.kind(), error = %err, "Rule evaluation failed, denying");
        false
    }
}

/// Default TTL for the chain-read cache when unconfigured.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
