//! Ops endpoints: liveness, readiness, detailed health, metrics.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::AppState;

/// Always OK while the process is up.
pub async fn live() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// OK only when the database answers.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": err.to_string() })),
        ),
    }
}

/// Per-subsystem statuses and the key safety flags.
pub async fn detailed(State(state): State<AppState>) -> impl IntoResponse {
    let database_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();

    let (killswitch, safe_mode) = match state.safety.flags().await {
        Ok(flags) => (flags.killswitch_active, flags.safe_mode_active),
        Err(_) => (false, false),
    };

    let dlq_depth: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue WHERE resolved_at IS NULL")
            .fetch_one(&state.pool)
            .await
            .unwrap_or(-1);

    let status = if database_ok { "ok" } else { "degraded" };
    let code = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": status,
            "subsystems": {
                "database": database_ok,
                "killswitch_active": killswitch,
                "safe_mode_active": safe_mode,
            },
            "gauges": {
                "dlq_depth": dlq_depth,
            },
        })),
    )
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}
