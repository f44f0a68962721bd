//! API error envelope and request-id plumbing
//!
//! Every failure renders as `{error, code, request_id}` with a status that
//! tells the client whether a retry (with the same idempotency key) makes
//! sense.

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use hustle_core::CoreError;

/// Correlation id generated at ingress and echoed everywhere.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Middleware: mint the request id, expose it to handlers, echo it in the
/// response headers, and wrap the request in a tracing span.
pub async fn request_id_layer(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// A core error bound to its request id.
#[derive(Debug)]
pub struct ApiError {
    pub error: CoreError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: CoreError, request_id: &RequestId) -> Self {
        Self {
            error,
            request_id: request_id.0.clone(),
        }
    }
}

pub fn status_for(error: &CoreError) -> StatusCode {
    match error {
        CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
        CoreError::IllegalTransition { .. } => StatusCode::CONFLICT,
        CoreError::InvariantViolation { .. } => StatusCode::PRECONDITION_FAILED,
        CoreError::ConcurrencyConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::ExternalProvider { .. } => StatusCode::BAD_GATEWAY,
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::StuckRecovery(_) | CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        let body = json!({
            "error": self.error.to_string(),
            "code": self.error.code(),
            "request_id": self.request_id,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&CoreError::validation("bad_amount", "x")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CoreError::illegal_transition("task", "open", "completed", "no")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CoreError::invariant("INV-2", "x")),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            status_for(&CoreError::ConcurrencyConflict("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CoreError::not_found("task", "id")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CoreError::provider("stripe", "down", true)),
            StatusCode::BAD_GATEWAY
        );
    }
}
