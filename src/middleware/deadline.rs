//! Whole-request deadline and request accounting.
//!
//! The outermost layer of the chain. Every request runs under the
//! configured deadline; on breach the pipeline is aborted and the client
//! receives 504. Dropping the inner future propagates cancellation to every
//! suspended operation underneath (DB queries, RPC calls, cache waits).
//!
//! Finished requests are counted and timed for the metrics endpoint. The
//! `path` label is the matched route template (`/api/keys/{id}`), never the
//! raw URI: raw paths are client-controlled and would grow the Prometheus
//! registry without bound. Requests that matched no route are bucketed
//! under [`UNMATCHED_ROUTE`].

use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::errors::ApiError;
use crate::metrics::Metrics;

/// Metric label for requests that matched no registered route.
const UNMATCHED_ROUTE: &str = "<unmatched>";

/// Layer applying the whole-request deadline.
#[derive(Clone)]
pub struct DeadlineLayer {
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl DeadlineLayer {
    pub fn new(timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self { timeout, metrics }
    }
}

impl<S> Layer<S> for DeadlineLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = DeadlineService;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            timeout: self.timeout,
            metrics: Arc::clone(&self.metrics),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

#[derive(Clone)]
pub struct DeadlineService {
    timeout: Duration,
    metrics: Arc<Metrics>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl Service<Request> for DeadlineService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let timeout = self.timeout;
        let metrics = Arc::clone(&self.metrics);
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let method = req.method().as_str().to_string();
            // Router layers run after routing, so the matched template is
            // already in the extensions for registered routes.
            let route = req
                .extensions()
                .get::<MatchedPath>()
                .map(|matched| matched.as_str().to_string())
                .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
            let path = req.uri().path().to_string();
            let started = Instant::now();

            let response = match tokio::time::timeout(timeout, inner.call(req)).await {
                Ok(Ok(response)) => response,
                Ok(Err(infallible)) => match infallible {},
                Err(_elapsed) => {
                    tracing::warn!(method = %method, path = %path, "Request deadline exceeded");
                    ApiError::new(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
                        .with_details("request deadline exceeded")
                        .into_response()
                }
            };

            metrics
                .http_requests
                .with_label_values(&[method.as_str(), route.as_str(), response.status().as_str()])
                .inc();
            metrics
                .http_duration
                .with_label_values(&[method.as_str(), route.as_str()])
                .observe(started.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use tower::ServiceExt;

    fn slow_service(delay: Duration) -> BoxCloneSyncService<Request, Response, Infallible> {
        BoxCloneSyncService::new(tower::service_fn(move |_req: Request| async move {
            tokio::time::sleep(delay).await;
            Ok(StatusCode::OK.into_response())
        }))
    }

    fn request() -> Request {
        HttpRequest::builder()
            .uri("/api/data")
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn fast_requests_pass() {
        let layer = DeadlineLayer::new(Duration::from_secs(1), Arc::new(Metrics::new()));
        let service = layer.layer(slow_service(Duration::from_millis(1)));
        let response = service.oneshot(request()).await.expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn slow_requests_get_504() {
        let layer = DeadlineLayer::new(Duration::from_millis(10), Arc::new(Metrics::new()));
        let service = layer.layer(slow_service(Duration::from_secs(5)));
        let response = service.oneshot(request()).await.expect("infallible");
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn metrics_use_the_route_template_not_the_raw_path() {
        let metrics = Arc::new(Metrics::new());
        let app = Router::new()
            .route("/api/keys/{id}", get(|| async { StatusCode::NO_CONTENT }))
            .layer(DeadlineLayer::new(Duration::from_secs(1), Arc::clone(&metrics)));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/keys/3f0c9a5e-9f2c-4a6d-8e57-0a3bfb5a8f01")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let rendered = metrics.render();
        assert!(rendered.contains(r#"path="/api/keys/{id}""#));
        assert!(!rendered.contains("3f0c9a5e"));
    }

    #[tokio::test]
    async fn unmatched_requests_share_one_label() {
        let metrics = Arc::new(Metrics::new());
        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .layer(DeadlineLayer::new(Duration::from_secs(1), Arc::clone(&metrics)));

        for uri in ["/not/registered", "/another/random/path"] {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri(uri)
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("infallible");
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        let rendered = metrics.render();
        assert!(rendered.contains(r#"path="<unmatched>""#));
        assert!(!rendered.contains("/not/registered"));
        assert!(!rendered.contains("/another/random/path"));
    }
}
