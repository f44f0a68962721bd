//! State-changing route handlers.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use hustle_engine::{
    ordering_gate::GateOutcome,
    tasks::{CreateTaskRequest, SubmitProofRequest},
};

use crate::{
    error::{ApiError, RequestId},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct AcceptBody {
    pub worker_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ProofBody {
    pub worker_id: Uuid,
    #[serde(default)]
    pub forensics: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    #[serde(default)]
    pub admin_id: Option<Uuid>,
    #[serde(default)]
    pub event_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DisputeBody {
    pub reason: String,
    pub opened_by: Uuid,
}

/// POST /tasks — create the task and its pending escrow.
pub async fn create_task(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .tasks
        .create_task(body)
        .await
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok((StatusCode::CREATED, Json(json!({ "task": task }))))
}

/// POST /tasks/{id}/accept — OPEN -> ACCEPTED.
pub async fn accept_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<AcceptBody>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .tasks
        .accept_task(task_id, body.worker_id)
        .await
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "task": task })))
}

/// POST /tasks/{id}/proof — submit proof of completion.
pub async fn submit_proof(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<ProofBody>,
) -> Result<impl IntoResponse, ApiError> {
    let proof_id = state
        .tasks
        .submit_proof(SubmitProofRequest {
            task_id,
            worker_id: body.worker_id,
            forensics: body.forensics,
        })
        .await
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "proof_id": proof_id })))
}

/// POST /tasks/{id}/complete — verify proof and release the payout.
pub async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<CompleteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .tasks
        .complete_task(task_id, body.admin_id, body.event_id)
        .await
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "outcome": outcome })))
}

/// POST /tasks/{id}/dispute — open a dispute.
pub async fn open_dispute(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<DisputeBody>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .tasks
        .open_dispute(task_id, body.reason, body.opened_by)
        .await
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(json!({ "disputed": true })))
}

/// POST /webhooks/stripe — provider webhook ingress.
///
/// Only a signature failure returns 400; every other outcome is a 200 so
/// the provider stops retrying and our sweeps own the retry.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok());

    match state.gate.ingest(signature, &body).await {
        GateOutcome::Rejected(reason) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": reason, "code": "bad_signature" })),
        ),
        GateOutcome::Acknowledged(ack) => (StatusCode::OK, Json(ack)),
    }
}
