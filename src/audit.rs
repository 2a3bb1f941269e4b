//! Structured audit event stream.
//!
//! Every authentication attempt, API-key lifecycle event, and authorization
//! decision produces an [`AuditEvent`]. Emission is non-blocking: events go
//! through a bounded channel to a single worker that writes them as JSON
//! lines under the `audit` tracing target. When the channel is full the
//! event is dropped and a counter incremented; the request never waits on
//! the sink.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::Metrics;

/// Capacity of the sink channel before events are dropped.
const CHANNEL_CAPACITY: usize = 1024;

/// What happened.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SiweNonceIssued,
    SiweLogin,
    Authenticate,
    ApiKeyCreated,
    ApiKeyRevoked,
    ApiKeyUsed,
    PolicyDecision,
    PolicyReload,
}

/// How it ended.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    Granted,
    Denied,
    Cancelled,
}

/// Policy evaluation metadata attached to authorization decisions.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PolicyAudit {
    /// Identifiers of the policies applicable to the route.
    pub policy_ids: Vec<String>,
    /// Total number of rules across those policies.
    pub rule_count: usize,
    /// Chain-read cache hits and misses during evaluation.
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// End-to-end evaluation latency in milliseconds.
    pub latency_ms: u64,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyAudit>,
}

impl AuditEvent {
    /// Starts an event with the current timestamp and empty context.
    pub fn new(action: AuditAction, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            result,
            address: None,
            key_id: None,
            method: String::new(),
            path: String::new(),
            client_addr: None,
            error_code: None,
            policy: None,
        }
    }

    pub fn with_request(mut self, method: &str, path: &str) -> Self {
        self.method = method.to_string();
        self.path = path.to_string();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_key_id(mut self, key_id: Uuid) -> Self {
        self.key_id = Some(key_id);
        self
    }

    pub fn with_client_addr(mut self, client_addr: Option<String>) -> Self {
        self.client_addr = client_addr;
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_policy(mut self, policy: PolicyAudit) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Handle for submitting audit events.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
    metrics: Arc<Metrics>,
}

impl AuditSink {
    /// Spawns the sink worker and returns the submission handle.
    ///
    /// The worker drains remaining events when `shutdown` fires, then exits.
    pub fn spawn(metrics: Arc<Metrics>, shutdown: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => write(&event),
                        None => break,
                    },
                    _ = shutdown.cancelled() => {
                        while let Ok(event) = rx.try_recv() {
                            write(&event);
                        }
                        break;
                    }
                }
            }
        });
        Self { tx, metrics }
    }

    /// Non-blocking submit; drops the event with a counter bump on overflow.
    pub fn emit(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            self.metrics.audit_dropped.inc();
        }
    }
}

fn write(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(line) => tracing::info!(target: "audit", "{line}"),
        Err(err) => tracing::warn!(target: "audit", error = %err, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_never_blocks_when_channel_is_full() {
        let metrics = Arc::new(Metrics::new());
        let shutdown = CancellationToken::new();
        // Cancelled immediately so the worker stops consuming.
        shutdown.cancel();
        let sink = AuditSink::spawn(Arc::clone(&metrics), shutdown);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        for _ in 0..(CHANNEL_CAPACITY + 64) {
            sink.emit(AuditEvent::new(AuditAction::Authenticate, AuditResult::Failure));
        }
        assert!(metrics.audit_dropped.get() > 0);
    }

    #[test]
    fn events_serialize_without_empty_optionals() {
        let event = AuditEvent::new(AuditAction::PolicyDecision, AuditResult::Denied)
            .with_request("GET", "/api/data")
            .with_address("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed");
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"action\":\"policy_decision\""));
        assert!(json.contains("\"result\":\"denied\""));
        assert!(!json.contains("key_id"));
        assert!(!json.contains("error_code"));
    }
}
