//! The HTTP error envelope.
//!
//! Every error response carries `{error, details?}`. The `error` kind is a
//! stable machine-readable string; `details` is optional human-readable
//! context. 401 responses set `WWW-Authenticate`; 429 responses carry
//! `Retry-After` (set by the rate limiter).

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// JSON error envelope returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// An error response: status code plus envelope.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: kind.into(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.body.details = Some(details.into());
        self
    }

    pub fn bad_request(kind: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, kind)
    }

    pub fn unauthorized(kind: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, kind)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden")
    }

    pub fn not_found(kind: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, kind)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal")
    }

    /// The stable error kind, used for audit records.
    pub fn kind(&self) -> &str {
        &self.body.error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_sets_www_authenticate() {
        let response = ApiError::unauthorized("invalid_token").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[test]
    fn details_are_omitted_when_absent() {
        let body = ErrorBody {
            error: "forbidden".to_string(),
            details: None,
        };
        assert_eq!(serde_json::to_string(&body).expect("serialize"), r#"{"error":"forbidden"}"#);
    }
}
