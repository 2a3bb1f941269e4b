//! Tracing subscriber bootstrap.
//!
//! Log verbosity comes from `RUST_LOG` when set, otherwise from the
//! configured `LOG_LEVEL`. Audit events share the subscriber under the
//! `audit` target. Secrets never reach log output: the session secret is
//! not formatted anywhere, and API keys are logged only as hash prefixes.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. Call once at startup.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
