//! HTTP surface for the money core
//!
//! JSON in, JSON out, snake_case fields. State-changing routes require an
//! `X-Idempotency-Key` header and serve the cached prior response for 24 h;
//! the webhook route answers 400 only on signature failure. Every response
//! carries an `x-request-id` that also threads through the logs.

pub mod error;
pub mod health;
pub mod idempotency;
pub mod routes;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use hustle_engine::{
    metrics::CoreMetrics, ordering_gate::OrderingGate, safety::SafetyControls, tasks::TaskService,
};

/// Shared handler state, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub gate: Arc<OrderingGate>,
    pub tasks: Arc<TaskService>,
    pub metrics: Arc<CoreMetrics>,
    pub safety: SafetyControls,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let idempotent = Router::new()
        .route("/tasks", post(routes::create_task))
        .route("/tasks/:id/accept", post(routes::accept_task))
        .route("/tasks/:id/proof", post(routes::submit_proof))
        .route("/tasks/:id/complete", post(routes::complete_task))
        .route("/tasks/:id/dispute", post(routes::open_dispute))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            idempotency::layer,
        ));

    Router::new()
        .merge(idempotent)
        .route("/webhooks/stripe", post(routes::stripe_webhook))
        .route("/health", get(health::detailed))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .layer(middleware::from_fn(error::request_id_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
