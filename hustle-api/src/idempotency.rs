//! API-level idempotency
//!
//! Each state-changing request must carry `X-Idempotency-Key`. The first
//! arrival claims the key (`INSERT ... ON CONFLICT DO NOTHING`) and runs the
//! handler; the stored response is served to replays for 24 hours. A
//! concurrent duplicate (claim exists, response not yet stored) answers 409.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::{error::RequestId, AppState};

const RETENTION_HOURS: i64 = 24;
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub async fn layer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(|| RequestId("unknown".to_string()));

    let Some(key) = request
        .headers()
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return envelope(
            StatusCode::BAD_REQUEST,
            "missing_idempotency_key",
            "X-Idempotency-Key header is required",
            &request_id,
        );
    };

    // Buffer the body so its hash can pin the key to one request shape.
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return envelope(
                StatusCode::BAD_REQUEST,
                "body_too_large",
                "request body exceeds limit",
                &request_id,
            )
        }
    };
    let request_hash = hex::encode(Sha256::digest(&bytes));

    let claimed = sqlx::query(
        r#"
        INSERT INTO idempotency_keys (key, request_hash, expires_at)
        VALUES ($1, $2, NOW() + make_interval(hours => $3))
        ON CONFLICT (key) DO NOTHING
        RETURNING key
        "#,
    )
    .bind(&key)
    .bind(&request_hash)
    .bind(RETENTION_HOURS as f64)
    .fetch_optional(&state.pool)
    .await;

    match claimed {
        Ok(Some(_)) => {}
        Ok(None) => return replay(&state, &key, &request_hash, &request_id).await,
        Err(err) => {
            return envelope(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage",
                &err.to_string(),
                &request_id,
            )
        }
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    let response = next.run(request).await;
    store_response(&state, &key, response, &request_id).await
}

async fn replay(
    state: &AppState,
    key: &str,
    request_hash: &str,
    request_id: &RequestId,
) -> Response {
    let row = sqlx::query(
        r#"
        SELECT request_hash, response_status, response_body
        FROM idempotency_keys
        WHERE key = $1 AND expires_at > NOW()
        "#,
    )
    .bind(key)
    .fetch_optional(&state.pool)
    .await;

    let Ok(Some(row)) = row else {
        // Expired (or racing the daily cleanup): ask the caller to retry
        // with a fresh key.
        return envelope(
            StatusCode::CONFLICT,
            "idempotency_expired",
            "key expired; retry with a new key",
            request_id,
        );
    };

    let stored_hash: String = row.try_get("request_hash").unwrap_or_default();
    if stored_hash != request_hash {
        return envelope(
            StatusCode::CONFLICT,
            "idempotency_mismatch",
            "key was used with a different request body",
            request_id,
        );
    }

    let status: Option<i32> = row.try_get("response_status").ok().flatten();
    let body: Option<serde_json::Value> = row.try_get("response_body").ok().flatten();
    match (status, body) {
        (Some(status), Some(body)) => {
            let status =
                StatusCode::from_u16(status as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(body)).into_response()
        }
        // Claimed but not finished: a concurrent duplicate.
        _ => envelope(
            StatusCode::CONFLICT,
            "idempotency_conflict",
            "request with this key is still in flight",
            request_id,
        ),
    }
}

async fn store_response(
    state: &AppState,
    key: &str,
    response: Response,
    request_id: &RequestId,
) -> Response {
    let status = response.status();
    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return envelope(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage",
                "response body buffering failed",
                request_id,
            )
        }
    };

    let body_json: serde_json::Value =
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({ "raw": true }));

    // 5xx responses are not cached: the client retries the same key and the
    // handler runs again once the claim is released.
    if status.is_server_error() {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1")
            .bind(key)
            .execute(&state.pool)
            .await
            .ok();
    } else {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET response_status = $2, response_body = $3
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(status.as_u16() as i32)
        .bind(&body_json)
        .execute(&state.pool)
        .await
        .ok();
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn envelope(status: StatusCode, code: &str, message: &str, request_id: &RequestId) -> Response {
    (
        status,
        Json(json!({
            "error": message,
            "code": code,
            "request_id": request_id.0,
        })),
    )
        .into_response()
}
