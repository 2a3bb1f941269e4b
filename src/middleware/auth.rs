//! Authentication middleware.
//!
//! Extracts a bearer credential, resolves it to [`Claims`], and attaches
//! them to the request extensions. Precedence:
//!
//! 1. `X-API-Key: <64 hex>`
//! 2. `Authorization: Bearer <token>`, where 64 hex characters with no dots
//!    is treated as an API key and anything else as a session token.
//!
//! On failure or absence the request passes through *without* claims; this
//! middleware never answers 401 itself, so unauthenticated endpoints can
//! live in the same chain. The specific failure cause is audited and a
//! generic [`AuthFailure`] marker is left for downstream status mapping.

use axum::extract::Request;
use axum::response::Response;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::address;
use crate::audit::{AuditAction, AuditEvent, AuditResult, AuditSink};
use crate::metrics::Metrics;
use crate::store::api_keys::{ApiKeyError, ApiKeyStore, is_well_formed};
use crate::store::users::UserStore;
use crate::token::{SessionSigner, TokenError};

use super::{AuthFailure, Claims, CredentialKind, client_addr};

/// Shared state for credential resolution.
pub struct AuthState {
    pub sessions: Arc<SessionSigner>,
    pub api_keys: ApiKeyStore,
    pub users: UserStore,
    pub audit: AuditSink,
    pub metrics: Arc<Metrics>,
    pub trust_proxy: bool,
}

/// Middleware layer attaching claims to authenticated requests.
#[derive(Clone)]
pub struct AuthLayer {
    state: Arc<AuthState>,
}

impl AuthLayer {
    pub fn new(state: Arc<AuthState>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for AuthLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = AuthService;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            state: Arc::clone(&self.state),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Wraps the inner service with credential extraction.
#[derive(Clone)]
pub struct AuthService {
    state: Arc<AuthState>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl Service<Request> for AuthService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let state = Arc::clone(&self.state);
        let mut inner = self.inner.clone();
        let credential = extract_credential(&req);
        let client = client_addr(req.headers(), req.extensions(), state.trust_proxy);
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        Box::pin(async move {
            match credential {
                None => {}
                Some(credential) => {
                    match resolve(&state, client, &method, &path, credential).await {
                        Ok(claims) => {
                            req.extensions_mut().insert(claims);
                        }
                        Err(failure) => {
                            req.extensions_mut().insert(failure);
                        }
                    }
                }
            }
            inner.call(req).await
        })
    }
}

/// A credential as presented on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Credential {
    ApiKey(String),
    SessionToken(String),
}

/// Applies the header precedence and the 64-hex-no-dots dispatch rule.
fn extract_credential(req: &Request) -> Option<Credential> {
    if let Some(value) = req.headers().get("x-api-key")
        && let Ok(raw) = value.to_str()
    {
        return Some(Credential::ApiKey(raw.trim().to_string()));
    }
    let authorization = req.headers().get("authorization")?.to_str().ok()?;
    let token = authorization.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    if !token.contains('.') && is_well_formed(token) {
        Some(Credential::ApiKey(token.to_string()))
    } else {
        Some(Credential::SessionToken(token.to_string()))
    }
}

async fn resolve(
    state: &AuthState,
    client: Option<String>,
    method: &str,
    path: &str,
    credential: Credential,
) -> Result<Claims, AuthFailure> {
    match credential {
        Credential::ApiKey(raw) => match validate_api_key(state, &raw).await {
            Ok(claims) => {
                state
                    .metrics
                    .auth_attempts
                    .with_label_values(&[CredentialKind::ApiKey.label(), "success"])
                    .inc();
                state.audit.emit(
                    AuditEvent::new(AuditAction::ApiKeyUsed, AuditResult::Success)
                        .with_request(method, path)
                        .with_address(claims.canonical_address())
                        .with_key_id(claims.key_id.unwrap_or_default())
                        .with_client_addr(client),
                );
                Ok(claims)
            }
            Err((failure, cause)) => {
                state
                    .metrics
                    .auth_attempts
                    .with_label_values(&[CredentialKind::ApiKey.label(), "failure"])
                    .inc();
                state.audit.emit(
                    AuditEvent::new(AuditAction::Authenticate, AuditResult::Failure)
                        .with_request(method, path)
                        .with_client_addr(client)
                        .with_error_code(cause),
                );
                Err(failure)
            }
        },
        Credential::SessionToken(token) => match validate_session(state, &token) {
            Ok(claims) => {
                state
                    .metrics
                    .auth_attempts
                    .with_label_values(&[CredentialKind::SessionToken.label(), "success"])
                    .inc();
                state.audit.emit(
                    AuditEvent::new(AuditAction::Authenticate, AuditResult::Success)
                        .with_request(method, path)
                        .with_address(claims.canonical_address())
                        .with_client_addr(client),
                );
                Ok(claims)
            }
            Err((failure, cause)) => {
                state
                    .metrics
                    .auth_attempts
                    .with_label_values(&[CredentialKind::SessionToken.label(), "failure"])
                    .inc();
                state.audit.emit(
                    AuditEvent::new(AuditAction::Authenticate, AuditResult::Failure)
                        .with_request(method, path)
                        .with_client_addr(client)
                        .with_error_code(cause),
                );
                Err(failure)
            }
        },
    }
}

/// Resolves an API key to claims. The returned string is the audited cause;
/// the public response never distinguishes not-found from expired.
async fn validate_api_key(
    state: &AuthState,
    raw: &str,
) -> Result<Claims, (AuthFailure, &'static str)> {
    let record = state.api_keys.validate(raw).await.map_err(|err| match err {
        ApiKeyError::InvalidFormat => (AuthFailure::InvalidApiKey, "api_key_malformed"),
        ApiKeyError::NotFound => (AuthFailure::InvalidApiKey, "api_key_not_found"),
        ApiKeyError::Expired => (AuthFailure::InvalidApiKey, "api_key_expired"),
        ApiKeyError::Store(_) => (AuthFailure::Internal, "store_error"),
        _ => (AuthFailure::InvalidApiKey, "api_key_rejected"),
    })?;
    let user = state
        .users
        .get_by_id(record.user_id)
        .await
        .map_err(|_| (AuthFailure::Internal, "store_error"))?
        .ok_or((AuthFailure::InvalidApiKey, "api_key_orphaned"))?;
    let address = address::normalize(&user.address)
        .map_err(|_| (AuthFailure::Internal, "stored_address_invalid"))?;
    Ok(Claims {
        address,
        scopes: record.scopes,
        credential: CredentialKind::ApiKey,
        user_id: Some(record.user_id),
        key_id: Some(record.id),
    })
}

fn validate_session(
    state: &AuthState,
    token: &str,
) -> Result<Claims, (AuthFailure, &'static str)> {
    let claims = state.sessions.verify(token).map_err(|err| match err {
        TokenError::Expired => (AuthFailure::InvalidToken, "token_expired"),
        _ => (AuthFailure::InvalidToken, "token_invalid"),
    })?;
    let address = address::normalize(&claims.sub)
        .map_err(|_| (AuthFailure::InvalidToken, "token_subject_invalid"))?;
    Ok(Claims {
        address,
        scopes: claims.scopes,
        credential: CredentialKind::SessionToken,
        user_id: None,
        key_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn request_with_headers(headers: &[(&str, &str)]) -> Request {
        let mut builder = HttpRequest::builder().uri("/api/data");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).expect("request")
    }

    const RAW_KEY: &str = "aaaabbbbccccddddeeeeffff0000111122223333444455556666777788889999";

    #[test]
    fn x_api_key_header_takes_precedence() {
        let req = request_with_headers(&[
            ("x-api-key", RAW_KEY),
            ("authorization", "Bearer some.jwt.token"),
        ]);
        assert_eq!(
            extract_credential(&req),
            Some(Credential::ApiKey(RAW_KEY.to_string()))
        );
    }

    #[test]
    fn bearer_64_hex_is_an_api_key() {
        let req = request_with_headers(&[("authorization", &format!("Bearer {RAW_KEY}"))]);
        assert_eq!(
            extract_credential(&req),
            Some(Credential::ApiKey(RAW_KEY.to_string()))
        );
    }

    #[test]
    fn bearer_with_dots_is_a_session_token() {
        let req = request_with_headers(&[("authorization", "Bearer eyJh.eyJz.sig")]);
        assert_eq!(
            extract_credential(&req),
            Some(Credential::SessionToken("eyJh.eyJz.sig".to_string()))
        );
    }

    #[test]
    fn bearer_of_other_shapes_is_a_session_token() {
        let req = request_with_headers(&[("authorization", "Bearer opaque-token")]);
        assert_eq!(
            extract_credential(&req),
            Some(Credential::SessionToken("opaque-token".to_string()))
        );
    }

    #[test]
    fn absent_headers_yield_no_credential() {
        let req = request_with_headers(&[]);
        assert_eq!(extract_credential(&req), None);
        let req = request_with_headers(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert_eq!(extract_credential(&req), None);
    }
}
