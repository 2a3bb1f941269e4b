//! Policy configuration and the route → policy registry.
//!
//! Policies are loaded from a JSON document, validated rule by rule, and
//! installed into a lookup table keyed by `(method, path)`. The table is an
//! immutable snapshot behind a reader-writer lock: a reload builds the new
//! table completely and swaps it in one write, so in-flight requests see
//! either the old or the new table, never a torn one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::rules::{Logic, Rule, RuleConfig, RuleValidationError};

/// Wire form of one policy in the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub path: String,
    pub method: String,
    pub logic: Logic,
    pub rules: Vec<RuleConfig>,
}

/// A validated policy attached to a route.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Stable identifier used in audit events, derived from position.
    pub id: String,
    pub path: String,
    /// Uppercased HTTP method.
    pub method: String,
    pub logic: Logic,
    pub rules: Vec<Rule>,
}

/// Load failures, pointing at the offending policy (and rule, if any).
#[derive(Debug, thiserror::Error)]
pub enum PolicyLoadError {
    #[error("failed to parse policy document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("policy[{policy}]: {reason}")]
    InvalidPolicy { policy: usize, reason: String },
    #[error("policy[{policy}].rule[{rule}]: {reason}")]
    InvalidRule {
        policy: usize,
        rule: usize,
        reason: RuleValidationError,
    },
}

/// Parses and validates a policy document.
///
/// `chain_known` reflects the configured RPC endpoints so that on-chain
/// rules referencing an unconfigured chain are rejected at load time.
pub fn load_policies(
    document: &str,
    default_chain: u64,
    chain_known: &dyn Fn(u64) -> bool,
) -> Result<Vec<Policy>, PolicyLoadError> {
    let configs: Vec<PolicyConfig> = serde_json::from_str(document)?;
    validate_policies(&configs, default_chain, chain_known)
}

/// Validates parsed policy configurations.
pub fn validate_policies(
    configs: &[PolicyConfig],
    default_chain: u64,
    chain_known: &dyn Fn(u64) -> bool,
) -> Result<Vec<Policy>, PolicyLoadError> {
    let mut policies = Vec::with_capacity(configs.len());
    for (policy_index, config) in configs.iter().enumerate() {
        let path = config.path.trim();
        if path.is_empty() {
            return Err(PolicyLoadError::InvalidPolicy {
                policy: policy_index,
                reason: "path must not be empty".to_string(),
            });
        }
        let method = config.method.trim().to_ascii_uppercase();
        if method.is_empty() {
            return Err(PolicyLoadError::InvalidPolicy {
                policy: policy_index,
                reason: "method must not be empty".to_string(),
            });
        }
        if config.rules.is_empty() {
            return Err(PolicyLoadError::InvalidPolicy {
                policy: policy_index,
                reason: "at least one rule is required".to_string(),
            });
        }
        let mut rules = Vec::with_capacity(config.rules.len());
        for (rule_index, rule_config) in config.rules.iter().enumerate() {
            let rule = rule_config
                .validate(default_chain, chain_known)
                .map_err(|reason| PolicyLoadError::InvalidRule {
                    policy: policy_index,
                    rule: rule_index,
                    reason,
                })?;
            rules.push(rule);
        }
        policies.push(Policy {
            id: format!("{method} {path}#{policy_index}"),
            path: path.to_string(),
            method,
            logic: config.logic,
            rules,
        });
    }
    Ok(policies)
}

type RouteKey = (String, String);
type PolicyTable = HashMap<RouteKey, Vec<Arc<Policy>>>;

/// Route → policies lookup with atomic table swap.
pub struct PolicyRegistry {
    table: RwLock<Arc<PolicyTable>>,
}

impl PolicyRegistry {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            table: RwLock::new(Arc::new(build_table(policies))),
        }
    }

    /// Replaces the whole table in one write-lock window.
    pub fn reload(&self, policies: Vec<Policy>) {
        let table = Arc::new(build_table(policies));
        let mut guard = self.table.write().expect("policy registry lock poisoned");
        *guard = table;
    }

    /// Exact-match lookup. An empty result admits the route unconditionally.
    pub fn match_route(&self, method: &str, path: &str) -> Vec<Arc<Policy>> {
        let table = {
            let guard = self.table.read().expect("policy registry lock poisoned");
            Arc::clone(&guard)
        };
        table
            .get(&(method.to_ascii_uppercase(), path.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of installed policies.
    pub fn len(&self) -> usize {
        let guard = self.table.read().expect("policy registry lock poisoned");
        guard.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_table(policies: Vec<Policy>) -> PolicyTable {
    let mut table: PolicyTable = HashMap::new();
    for policy in policies {
        let key = (policy.method.clone(), policy.path.clone());
        table.entry(key).or_default().push(Arc::new(policy));
    }
    table
}
