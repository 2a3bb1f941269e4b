//! Prometheus instrumentation.
//!
//! A single [`Metrics`] value owns the registry and every collector. It is
//! shared through the application state and rendered in the text exposition
//! format by the `/metrics` handler.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Registry plus the gateway's counters, histograms, and gauges.
pub struct Metrics {
    registry: Registry,
    /// Finished HTTP requests by method, route, and status code.
    pub http_requests: IntCounterVec,
    /// Request latency in seconds by method and route.
    pub http_duration: HistogramVec,
    /// Authentication attempts by credential kind and outcome.
    pub auth_attempts: IntCounterVec,
    /// Authorization decisions by outcome.
    pub policy_decisions: IntCounterVec,
    /// Rule evaluations that resolved to deny through a failure, by rule
    /// type and reason. Timeouts carry their own reason label.
    pub rule_failures: IntCounterVec,
    /// Chain-read cache hits and misses.
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    /// RPC attempts by chain and outcome.
    pub rpc_calls: IntCounterVec,
    /// RPC attempts that hit the per-attempt deadline, by chain.
    pub rpc_timeouts: IntCounterVec,
    /// Requests rejected by the rate limiter, by bucket.
    pub rate_limited: IntCounterVec,
    /// Audit events dropped because the sink channel was full.
    pub audit_dropped: IntCounter,
    /// Policy rule evaluation latency in seconds.
    pub rule_duration: Histogram,
    /// Database pool occupancy, refreshed when metrics are scraped.
    pub db_pool_size: IntGauge,
    pub db_pool_idle: IntGauge,
}

impl Metrics {
    /// Builds the registry and registers every collector.
    ///
    /// Collector construction is static configuration; failures here are
    /// programming errors, so this panics rather than returning a result.
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("gatekeeper_http_requests_total", "Finished HTTP requests"),
            &["method", "path", "status"],
        )
        .expect("valid metric definition");
        let http_duration = HistogramVec::new(
            HistogramOpts::new("gatekeeper_http_duration_seconds", "HTTP request latency"),
            &["method", "path"],
        )
        .expect("valid metric definition");
        let auth_attempts = IntCounterVec::new(
            Opts::new("gatekeeper_auth_attempts_total", "Authentication attempts"),
            &["credential", "result"],
        )
        .expect("valid metric definition");
        let policy_decisions = IntCounterVec::new(
            Opts::new("gatekeeper_policy_decisions_total", "Authorization decisions"),
            &["decision"],
        )
        .expect("valid metric definition");
        let rule_failures = IntCounterVec::new(
            Opts::new(
                "gatekeeper_rule_failures_total",
                "Rule evaluations denied through a loader failure",
            ),
            &["rule", "reason"],
        )
        .expect("valid metric definition");
        let cache_hits = IntCounter::new("gatekeeper_cache_hits_total", "Chain-read cache hits")
            .expect("valid metric definition");
        let cache_misses =
            IntCounter::new("gatekeeper_cache_misses_total", "Chain-read cache misses")
                .expect("valid metric definition");
        let rpc_calls = IntCounterVec::new(
            Opts::new("gatekeeper_rpc_calls_total", "JSON-RPC attempts"),
            &["chain", "outcome"],
        )
        .expect("valid metric definition");
        let rpc_timeouts = IntCounterVec::new(
            Opts::new("gatekeeper_rpc_timeouts_total", "JSON-RPC attempts timed out"),
            &["chain"],
        )
        .expect("valid metric definition");
        let rate_limited = IntCounterVec::new(
            Opts::new("gatekeeper_rate_limited_total", "Requests rejected by rate limiting"),
            &["bucket"],
        )
        .expect("valid metric definition");
        let audit_dropped = IntCounter::new(
            "gatekeeper_audit_dropped_total",
            "Audit events dropped on sink back-pressure",
        )
        .expect("valid metric definition");
        let rule_duration = Histogram::with_opts(HistogramOpts::new(
            "gatekeeper_rule_duration_seconds",
            "Policy rule evaluation latency",
        ))
        .expect("valid metric definition");
        let db_pool_size = IntGauge::new("gatekeeper_db_pool_connections", "Open DB connections")
            .expect("valid metric definition");
        let db_pool_idle = IntGauge::new("gatekeeper_db_pool_idle", "Idle DB connections")
            .expect("valid metric definition");

        for collector in [
            Box::new(http_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_duration.clone()),
            Box::new(auth_attempts.clone()),
            Box::new(policy_decisions.clone()),
            Box::new(rule_failures.clone()),
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(rpc_calls.clone()),
            Box::new(rpc_timeouts.clone()),
            Box::new(rate_limited.clone()),
            Box::new(audit_dropped.clone()),
            Box::new(rule_duration.clone()),
            Box::new(db_pool_size.clone()),
            Box::new(db_pool_idle.clone()),
        ] {
            registry.register(collector).expect("unique metric names");
        }

        Self {
            registry,
            http_requests,
            http_duration,
            auth_attempts,
            policy_decisions,
            rule_failures,
            cache_hits,
            cache_misses,
            rpc_calls,
            rpc_timeouts,
            rate_limited,
            audit_dropped,
            rule_duration,
            db_pool_size,
            db_pool_idle,
        }
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
