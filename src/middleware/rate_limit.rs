//! Token-bucket rate limiting keyed by caller identity.
//!
//! Backed by `governor`'s keyed limiters. The key is the authenticated
//! subject address when claims are present, otherwise the client address
//! (forwarded headers when trusted, else the socket peer). Two buckets are
//! configured by default: one for API-key creation (low rate, after
//! authentication) and one for general traffic (high rate, outermost).
//! Exceeding a bucket answers 429 with `Retry-After` and `X-RateLimit-*`
//! headers; the limiter rejects rather than queues.

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::convert::Infallible;
use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::errors::ApiError;
use crate::metrics::Metrics;

use super::{Claims, client_addr};

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// One named token bucket.
pub struct RateLimitState {
    bucket: &'static str,
    limiter: KeyedLimiter,
    clock: DefaultClock,
    /// Sustained rate over the window, reported in `X-RateLimit-Limit`.
    rate: u32,
    trust_proxy: bool,
    metrics: Arc<Metrics>,
}

/// Middleware layer applying one bucket.
#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

impl RateLimitLayer {
    /// Builds a bucket admitting `rate` requests per `window` with the given
    /// burst capacity.
    pub fn new(
        bucket: &'static str,
        rate: u32,
        window: Duration,
        burst: u32,
        trust_proxy: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        let rate = rate.max(1);
        let burst = NonZeroU32::new(burst.max(1)).expect("burst is non-zero by construction");
        let period = Duration::from_secs_f64(window.as_secs_f64() / f64::from(rate));
        let quota = Quota::with_period(period)
            .expect("period is non-zero by construction")
            .allow_burst(burst);
        let clock = DefaultClock::default();
        let limiter = RateLimiter::new(quota, DefaultKeyedStateStore::default(), clock.clone());
        Self {
            state: Arc::new(RateLimitState {
                bucket,
                limiter,
                clock,
                rate,
                trust_proxy,
                metrics,
            }),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = RateLimitService;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            state: Arc::clone(&self.state),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService {
    state: Arc<RateLimitState>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl Service<Request> for RateLimitService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let state = Arc::clone(&self.state);
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let key = identifier(&req, state.trust_proxy);
            match state.limiter.check_key(&key) {
                Ok(_) => inner.call(req).await,
                Err(not_until) => {
                    state
                        .metrics
                        .rate_limited
                        .with_label_values(&[state.bucket])
                        .inc();
                    let wait = not_until.wait_time_from(state.clock.now());
                    tracing::debug!(
                        bucket = state.bucket,
                        key = %key,
                        retry_after_secs = wait.as_secs(),
                        "Rate limit exceeded"
                    );
                    Ok(too_many_requests(state.rate, wait))
                }
            }
        })
    }
}

/// Identifier precedence: authenticated subject, then client address.
fn identifier(req: &Request, trust_proxy: bool) -> String {
    if let Some(claims) = req.extensions().get::<Claims>() {
        return claims.canonical_address();
    }
    client_addr(req.headers(), req.extensions(), trust_proxy)
        .unwrap_or_else(|| "unknown".to_string())
}

fn too_many_requests(limit: u32, wait: Duration) -> Response {
    // Round up so a client that waits the advertised time will succeed.
    let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    let mut response = ApiError::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited")
        .with_details("too many requests")
        .into_response();
    let headers = response.headers_mut();
    headers.insert("Retry-After", header_value(retry_after));
    headers.insert("X-RateLimit-Limit", header_value(u64::from(limit)));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
    headers.insert("X-RateLimit-Reset", header_value(retry_after));
    response
}

fn header_value(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("integers are valid header values")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn ok_service() -> BoxCloneSyncService<Request, Response, Infallible> {
        BoxCloneSyncService::new(tower::service_fn(|_req: Request| async {
            Ok(StatusCode::OK.into_response())
        }))
    }

    fn request_from(addr: &str) -> Request {
        HttpRequest::builder()
            .uri("/api/data")
            .header("x-forwarded-for", addr)
            .body(Body::empty())
            .expect("request")
    }

    fn layer(rate: u32, burst: u32) -> RateLimitLayer {
        RateLimitLayer::new(
            "test",
            rate,
            Duration::from_secs(60),
            burst,
            true,
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn burst_is_admitted_then_limited() {
        let mut service = layer(10, 3).layer(ok_service());
        for _ in 0..3 {
            let response = (&mut service)
                .oneshot(request_from("203.0.113.5"))
                .await
                .expect("infallible");
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = (&mut service)
            .oneshot(request_from("203.0.113.5"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("Retry-After"));
        assert_eq!(
            response
                .headers()
                .get("X-RateLimit-Remaining")
                .and_then(|v| v.to_str().ok()),
            Some("0")
        );
    }

    #[tokio::test]
    async fn buckets_are_keyed_per_client() {
        let mut service = layer(10, 1).layer(ok_service());
        let first = (&mut service)
            .oneshot(request_from("203.0.113.5"))
            .await
            .expect("infallible");
        assert_eq!(first.status(), StatusCode::OK);

        // The first client is now limited, a second one is not.
        let limited = (&mut service)
            .oneshot(request_from("203.0.113.5"))
            .await
            .expect("infallible");
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        let other = (&mut service)
            .oneshot(request_from("198.51.100.7"))
            .await
            .expect("infallible");
        assert_eq!(other.status(), StatusCode::OK);
    }
}
