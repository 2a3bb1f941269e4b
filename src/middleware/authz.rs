//! Authorization middleware.
//!
//! Looks up the policies attached to `(method, path)` and evaluates them
//! under the caller's claims. Routes without policies pass through
//! untouched. All applicable policies must allow (cross-policy AND); a deny
//! answers 403 with no rule-level detail. Every decision emits an audit
//! event carrying policy ids, rule counts, cache hit/miss counts, and
//! latency; a request dropped mid-evaluation still audits as `cancelled`.

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::audit::{AuditAction, AuditEvent, AuditResult, AuditSink, PolicyAudit};
use crate::errors::ApiError;
use crate::metrics::Metrics;
use crate::policy::{Policy, PolicyRegistry};
use crate::rules::{EvalStats, RuleEngine};

use super::{AuthFailure, Claims, client_addr};

/// Shared state for policy enforcement.
pub struct AuthzState {
    pub registry: Arc<PolicyRegistry>,
    pub engine: Arc<RuleEngine>,
    pub audit: AuditSink,
    pub metrics: Arc<Metrics>,
    pub trust_proxy: bool,
}

/// Middleware layer enforcing route policies.
#[derive(Clone)]
pub struct AuthzLayer {
    state: Arc<AuthzState>,
}

impl AuthzLayer {
    pub fn new(state: Arc<AuthzState>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for AuthzLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = AuthzService;

    fn layer(&self, inner: S) -> Self::Service {
        AuthzService {
            state: Arc::clone(&self.state),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

#[derive(Clone)]
pub struct AuthzService {
    state: Arc<AuthzState>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl Service<Request> for AuthzService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let state = Arc::clone(&self.state);
        let inner = self.inner.clone();
        Box::pin(async move {
            let gate = PolicyGate { state };
            gate.handle(inner, req).await
        })
    }
}

/// Evaluates the applicable policies for one request.
struct PolicyGate {
    state: Arc<AuthzState>,
}

impl PolicyGate {
    async fn handle(
        self,
        mut inner: BoxCloneSyncService<Request, Response, Infallible>,
        req: Request,
    ) -> Result<Response, Infallible> {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let policies = self.state.registry.match_route(&method, &path);
        if policies.is_empty() {
            // Unregistered routes are admitted unconditionally.
            return inner.call(req).await;
        }

        let Some(claims) = req.extensions().get::<Claims>().cloned() else {
            return Ok(self.reject_unauthenticated(&req, &method, &path));
        };

        let client = client_addr(req.headers(), req.extensions(), self.state.trust_proxy);
        let mut guard = DecisionAudit::new(
            self.state.audit.clone(),
            &method,
            &path,
            claims.canonical_address(),
            client,
            &policies,
        );

        let started = Instant::now();
        let mut stats = EvalStats::default();
        let mut allowed = true;
        for policy in &policies {
            let policy_allows = self
                .state
                .engine
                .evaluate(
                    policy.logic,
                    &policy.rules,
                    claims.address,
                    &claims.scopes,
                    &mut stats,
                )
                .await;
            if !policy_allows {
                allowed = false;
                break;
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        if allowed {
            self.state
                .metrics
                .policy_decisions
                .with_label_values(&["granted"])
                .inc();
            guard.finish(AuditResult::Granted, stats, latency_ms);
            inner.call(req).await
        } else {
            self.state
                .metrics
                .policy_decisions
                .with_label_values(&["denied"])
                .inc();
            guard.finish(AuditResult::Denied, stats, latency_ms);
            Ok(ApiError::forbidden().into_response())
        }
    }

    /// 401 for a protected route without claims. The public error kind comes
    /// from the auth middleware's failure marker; specifics stay audited.
    fn reject_unauthenticated(&self, req: &Request, method: &str, path: &str) -> Response {
        let failure = req.extensions().get::<AuthFailure>().copied();
        let client = client_addr(req.headers(), req.extensions(), self.state.trust_proxy);
        let error = match failure {
            Some(AuthFailure::Internal) => ApiError::internal(),
            Some(failure) => ApiError::unauthorized(failure.error_code()),
            None => ApiError::unauthorized("unauthorized")
                .with_details("authentication required"),
        };
        self.state.audit.emit(
            AuditEvent::new(AuditAction::PolicyDecision, AuditResult::Denied)
                .with_request(method, path)
                .with_client_addr(client)
                .with_error_code(error.kind().to_string()),
        );
        self.state
            .metrics
            .policy_decisions
            .with_label_values(&["unauthenticated"])
            .inc();
        error.into_response()
    }
}

/// Emits the decision audit event exactly once.
///
/// If the request future is dropped before a decision is reached (client
/// disconnect, deadline), the `Drop` impl emits the event with
/// `result = cancelled`.
struct DecisionAudit {
    sink: AuditSink,
    event: Option<AuditEvent>,
    policy: PolicyAudit,
}

impl DecisionAudit {
    fn new(
        sink: AuditSink,
        method: &str,
        path: &str,
        address: String,
        client: Option<String>,
        policies: &[Arc<Policy>],
    ) -> Self {
        let event = AuditEvent::new(AuditAction::PolicyDecision, AuditResult::Cancelled)
            .with_request(method, path)
            .with_address(address)
            .with_client_addr(client);
        let policy = PolicyAudit {
            policy_ids: policies.iter().map(|p| p.id.clone()).collect(),
            rule_count: policies.iter().map(|p| p.rules.len()).sum(),
            ..PolicyAudit::default()
        };
        Self {
            sink,
            event: Some(event),
            policy,
        }
    }

    fn finish(&mut self, result: AuditResult, stats: EvalStats, latency_ms: u64) {
        if let Some(mut event) = self.event.take() {
            event.result = result;
            self.policy.cache_hits = stats.cache_hits;
            self.policy.cache_misses = stats.cache_misses;
            self.policy.latency_ms = latency_ms;
            event = event.with_policy(self.policy.clone());
            self.sink.emit(event);
        }
    }
}

impl Drop for DecisionAudit {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.sink.emit(event.with_policy(self.policy.clone()));
        }
    }
}
