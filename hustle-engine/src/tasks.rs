//! Task lifecycle service
//!
//! Coordinates the task from posting through funding, acceptance, proof,
//! and completion. Entities are stored by id only; every operation resolves
//! the rows it needs inside its own transaction, and anything that moves
//! money is delegated to the payment saga.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use hustle_core::{ids, money, retry::run_serializable, CoreError, CoreResult};
use hustle_ledger::PgTx;

use crate::{
    outbox::{queues, OutboxClient, OutboxEventInput},
    saga::{PaymentSaga, SagaAction, SagaRequest},
    state_machine::{
        self, check_proof_transition, check_task_transition, EscrowState, ProofState,
        TaskGuardContext, TaskState,
    },
    stripe::StripeClient,
    trust::TrustService,
};

/// A task row as the engine reads it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub poster_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub price_cents: i64,
    pub state: TaskState,
    pub category: String,
}

/// An escrow row as the engine reads it.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowRecord {
    pub task_id: Uuid,
    pub state: EscrowState,
    pub amount_cents: i64,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub version: i64,
}

/// `SELECT ... FOR UPDATE` on a task row.
pub async fn load_task_for_update(tx: &mut PgTx<'_>, task_id: Uuid) -> CoreResult<TaskRecord> {
    let row = sqlx::query(
        r#"
        SELECT id, poster_id, worker_id, price_cents, state, category
        FROM tasks
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| CoreError::not_found("task", task_id.to_string()))?;

    Ok(TaskRecord {
        id: row.try_get("id").map_err(CoreError::from)?,
        poster_id: row.try_get("poster_id").map_err(CoreError::from)?,
        worker_id: row.try_get("worker_id").map_err(CoreError::from)?,
        price_cents: row.try_get("price_cents").map_err(CoreError::from)?,
        state: TaskState::parse(
            row.try_get::<String, _>("state")
                .map_err(CoreError::from)?
                .as_str(),
        )?,
        category: row.try_get("category").map_err(CoreError::from)?,
    })
}

/// `SELECT ... FOR UPDATE` on an escrow row.
pub async fn load_escrow_for_update(tx: &mut PgTx<'_>, task_id: Uuid) -> CoreResult<EscrowRecord> {
    let row = sqlx::query(
        r#"
        SELECT task_id, state, amount_cents, stripe_payment_intent_id, stripe_charge_id, version
        FROM escrows
        WHERE task_id = $1
        FOR UPDATE
        "#,
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| CoreError::not_found("escrow", task_id.to_string()))?;

    Ok(EscrowRecord {
        task_id: row.try_get("task_id").map_err(CoreError::from)?,
        state: EscrowState::parse(
            row.try_get::<String, _>("state")
                .map_err(CoreError::from)?
                .as_str(),
        )?,
        amount_cents: row.try_get("amount_cents").map_err(CoreError::from)?,
        stripe_payment_intent_id: row
            .try_get("stripe_payment_intent_id")
            .map_err(CoreError::from)?,
        stripe_charge_id: row.try_get("stripe_charge_id").map_err(CoreError::from)?,
        version: row.try_get("version").map_err(CoreError::from)?,
    })
}

/// Latest proof state for a task, if any proof exists.
pub async fn latest_proof(tx: &mut PgTx<'_>, task_id: Uuid) -> CoreResult<Option<ProofState>> {
    let state: Option<String> = sqlx::query_scalar(
        r#"
        SELECT state FROM proofs
        WHERE task_id = $1
        ORDER BY submitted_at DESC
        LIMIT 1
        "#,
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;
    state.as_deref().map(ProofState::parse).transpose()
}

/// Task creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub poster_id: Uuid,
    pub price_cents: i64,
    #[serde(default)]
    pub category: Option<String>,
}

/// Proof submission request.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitProofRequest {
    pub task_id: Uuid,
    pub worker_id: Uuid,
    #[serde(default)]
    pub forensics: serde_json::Value,
}

/// Lifecycle coordinator for tasks and their proofs.
#[derive(Clone)]
pub struct TaskService {
    pool: PgPool,
    saga: Arc<PaymentSaga>,
    stripe: Arc<StripeClient>,
    outbox: OutboxClient,
    trust: TrustService,
}

impl TaskService {
    pub fn new(
        pool: PgPool,
        saga: Arc<PaymentSaga>,
        stripe: Arc<StripeClient>,
        outbox: OutboxClient,
        trust: TrustService,
    ) -> Self {
        Self {
            pool,
            saga,
            stripe,
            outbox,
            trust,
        }
    }

    /// Create the task, its `pending` escrow, and the money-state pointer,
    /// then back the escrow with a provider PaymentIntent.
    pub async fn create_task(&self, req: CreateTaskRequest) -> CoreResult<TaskRecord> {
        money::require_positive_cents(req.price_cents)?;
        let task_id = Uuid::new_v4();
        let category = req.category.clone().unwrap_or_else(|| "general".to_string());

        let outbox = self.outbox.clone();
        let req_c = req.clone();
        let category_c = category.clone();
        run_serializable(&self.pool, move |tx| {
            let outbox = outbox.clone();
            let req = req_c.clone();
            let category = category_c.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO tasks (id, poster_id, price_cents, state, category)
                    VALUES ($1, $2, $3, 'open', $4)
                    "#,
                )
                .bind(task_id)
                .bind(req.poster_id)
                .bind(req.price_cents)
                .bind(&category)
                .execute(&mut **tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO escrows (task_id, state, amount_cents)
                    VALUES ($1, 'pending', $2)
                    "#,
                )
                .bind(task_id)
                .bind(req.price_cents)
                .execute(&mut **tx)
                .await?;

                state_machine::init_money_state(tx, task_id).await?;
                outbox
                    .enqueue(
                        tx,
                        OutboxEventInput {
                            aggregate_type: "task",
                            aggregate_id: task_id,
                            event_type: "task.created",
                            payload: json!({
                                "task_id": task_id,
                                "poster_id": req.poster_id,
                                "price_cents": req.price_cents,
                            }),
                            queue: queues::USER_NOTIFICATIONS,
                            idempotency_key: format!("outbox:task.created:{task_id}"),
                        },
                    )
                    .await
            }
            .boxed()
        })
        .await?;

        // The PaymentIntent is created after the rows exist so a provider
        // timeout cannot orphan provider state without a task to attach it
        // to. The deterministic key makes a retry converge on the same PI.
        let intent = self
            .stripe
            .create_payment_intent(req.price_cents, task_id, &format!("pi:{task_id}"))
            .await?;

        sqlx::query(
            "UPDATE escrows SET stripe_payment_intent_id = $2, updated_at = NOW() WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(&intent.id)
        .execute(&self.pool)
        .await?;

        info!(%task_id, payment_intent = %intent.id, "task created");
        Ok(TaskRecord {
            id: task_id,
            poster_id: req.poster_id,
            worker_id: None,
            price_cents: req.price_cents,
            state: TaskState::Open,
            category,
        })
    }

    /// OPEN -> ACCEPTED; requires a funded escrow.
    pub async fn accept_task(&self, task_id: Uuid, worker_id: Uuid) -> CoreResult<TaskRecord> {
        let outbox = self.outbox.clone();
        run_serializable(&self.pool, move |tx| {
            let outbox = outbox.clone();
            async move {
                state_machine::lock_money_state(tx, task_id).await?;
                let task = load_task_for_update(tx, task_id).await?;
                let escrow = load_escrow_for_update(tx, task_id).await?;

                let ctx = TaskGuardContext {
                    worker_id: Some(worker_id),
                    escrow_state: Some(escrow.state),
                    ..Default::default()
                };
                if let Err(err) = check_task_transition(task.state, TaskState::Accepted, &ctx) {
                    state_machine::record_conflict(
                        tx,
                        "task",
                        task_id,
                        "accept",
                        task.state.as_str(),
                        &err.to_string(),
                    )
                    .await?;
                    return Err(err);
                }

                sqlx::query(
                    "UPDATE tasks SET state = 'accepted', worker_id = $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(task_id)
                .bind(worker_id)
                .execute(&mut **tx)
                .await?;
                state_machine::record_transition(
                    tx,
                    "task",
                    task_id,
                    task.state.as_str(),
                    TaskState::Accepted.as_str(),
                    json!({ "worker_id": worker_id }),
                )
                .await?;

                outbox
                    .enqueue(
                        tx,
                        OutboxEventInput {
                            aggregate_type: "task",
                            aggregate_id: task_id,
                            event_type: "task.accepted",
                            payload: json!({ "task_id": task_id, "worker_id": worker_id }),
                            queue: queues::USER_NOTIFICATIONS,
                            idempotency_key: format!("outbox:task.accepted:{task_id}"),
                        },
                    )
                    .await?;

                Ok(TaskRecord {
                    worker_id: Some(worker_id),
                    state: TaskState::Accepted,
                    ..task
                })
            }
            .boxed()
        })
        .await
    }

    /// ACCEPTED -> PROOF_SUBMITTED with a new proof row.
    pub async fn submit_proof(&self, req: SubmitProofRequest) -> CoreResult<Uuid> {
        let proof_id = Uuid::new_v4();
        let outbox = self.outbox.clone();
        let req = req.clone();
        run_serializable(&self.pool, move |tx| {
            let outbox = outbox.clone();
            let req = req.clone();
            async move {
                state_machine::lock_money_state(tx, req.task_id).await?;
                let task = load_task_for_update(tx, req.task_id).await?;

                if task.worker_id != Some(req.worker_id) {
                    return Err(CoreError::validation(
                        "wrong_worker",
                        "only the assigned worker can submit proof",
                    ));
                }

                let ctx = TaskGuardContext {
                    proof_id: Some(proof_id),
                    ..Default::default()
                };
                if let Err(err) =
                    check_task_transition(task.state, TaskState::ProofSubmitted, &ctx)
                {
                    state_machine::record_conflict(
                        tx,
                        "task",
                        req.task_id,
                        "submit_proof",
                        task.state.as_str(),
                        &err.to_string(),
                    )
                    .await?;
                    return Err(err);
                }

                sqlx::query(
                    r#"
                    INSERT INTO proofs (id, task_id, worker_id, state, forensics)
                    VALUES ($1, $2, $3, 'submitted', $4)
                    "#,
                )
                .bind(proof_id)
                .bind(req.task_id)
                .bind(req.worker_id)
                .bind(&req.forensics)
                .execute(&mut **tx)
                .await?;

                sqlx::query(
                    "UPDATE tasks SET state = 'proof_submitted', updated_at = NOW() WHERE id = $1",
                )
                .bind(req.task_id)
                .execute(&mut **tx)
                .await?;
                state_machine::record_transition(
                    tx,
                    "task",
                    req.task_id,
                    task.state.as_str(),
                    TaskState::ProofSubmitted.as_str(),
                    json!({ "proof_id": proof_id }),
                )
                .await?;

                outbox
                    .enqueue(
                        tx,
                        OutboxEventInput {
                            aggregate_type: "proof",
                            aggregate_id: proof_id,
                            event_type: "proof.submitted",
                            payload: json!({
                                "task_id": req.task_id,
                                "proof_id": proof_id,
                                "worker_id": req.worker_id,
                            }),
                            queue: queues::FRAUD_DETECTION,
                            idempotency_key: format!("outbox:proof.submitted:{proof_id}"),
                        },
                    )
                    .await?;

                Ok(proof_id)
            }
            .boxed()
        })
        .await
    }

    /// Admin/system completion: verify the proof, then drive the payout
    /// saga (task COMPLETED + escrow released + XP in one commit), then try
    /// a trust upgrade.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        admin_id: Option<Uuid>,
        event_id: Option<String>,
    ) -> CoreResult<crate::saga::SagaOutcome> {
        self.verify_proof(task_id, admin_id).await?;

        let event_id = event_id.unwrap_or_else(|| ids::new_ulid().to_string());
        let outcome = self
            .saga
            .execute(SagaRequest {
                task_id,
                action: SagaAction::ReleasePayout,
                payload: json!({}),
                event_id,
                admin_override: admin_id,
            })
            .await?;

        // Tier upgrades ride after the money commit; a failure here must
        // never unwind a released escrow.
        if let Err(err) = self.try_trust_upgrade(task_id).await {
            tracing::warn!(%task_id, error = %err, "trust upgrade attempt failed");
        }

        Ok(outcome)
    }

    /// PROOF_SUBMITTED -> DISPUTED through the saga (state-only action).
    pub async fn open_dispute(
        &self,
        task_id: Uuid,
        reason: String,
        opened_by: Uuid,
    ) -> CoreResult<()> {
        self.saga
            .execute(SagaRequest {
                task_id,
                action: SagaAction::DisputeOpen,
                payload: json!({ "reason": reason, "opened_by": opened_by }),
                event_id: ids::new_ulid().to_string(),
                admin_override: None,
            })
            .await?;
        Ok(())
    }

    /// Cancel an unfunded task directly, or refund a funded one through the
    /// saga.
    pub async fn cancel_task(&self, task_id: Uuid, to: TaskState) -> CoreResult<()> {
        if !matches!(to, TaskState::Cancelled | TaskState::Expired) {
            return Err(CoreError::validation(
                "bad_state",
                "cancel target must be cancelled or expired",
            ));
        }

        let escrow_state = run_serializable(&self.pool, move |tx| {
            async move {
                state_machine::lock_money_state(tx, task_id).await?;
                Ok(load_escrow_for_update(tx, task_id).await?.state)
            }
            .boxed()
        })
        .await?;

        if matches!(escrow_state, EscrowState::Funded | EscrowState::Held) {
            self.saga
                .execute(SagaRequest {
                    task_id,
                    action: SagaAction::RefundEscrow,
                    payload: json!({ "cause": to.as_str() }),
                    event_id: ids::new_ulid().to_string(),
                    admin_override: None,
                })
                .await?;
            return Ok(());
        }

        // Unfunded: no money to move, but the provider intent is cancelled
        // so it cannot be captured later.
        let pi = run_serializable(&self.pool, move |tx| {
            async move {
                state_machine::lock_money_state(tx, task_id).await?;
                let task = load_task_for_update(tx, task_id).await?;
                check_task_transition(task.state, to, &TaskGuardContext::default())?;

                sqlx::query("UPDATE tasks SET state = $2, updated_at = NOW() WHERE id = $1")
                    .bind(task_id)
                    .bind(to.as_str())
                    .execute(&mut **tx)
                    .await?;
                state_machine::record_transition(
                    tx,
                    "task",
                    task_id,
                    task.state.as_str(),
                    to.as_str(),
                    json!({}),
                )
                .await?;
                Ok(load_escrow_for_update(tx, task_id)
                    .await?
                    .stripe_payment_intent_id)
            }
            .boxed()
        })
        .await?;

        if let Some(pi) = pi {
            self.stripe
                .cancel_payment_intent(&pi, &format!("cancel:{task_id}"))
                .await
                .ok();
        }
        Ok(())
    }

    async fn verify_proof(&self, task_id: Uuid, admin_id: Option<Uuid>) -> CoreResult<()> {
        run_serializable(&self.pool, move |tx| {
            async move {
                state_machine::lock_money_state(tx, task_id).await?;
                let current = latest_proof(tx, task_id).await?.ok_or_else(|| {
                    CoreError::validation("no_proof", "task has no submitted proof")
                })?;
                if current == ProofState::Verified {
                    return Ok(());
                }

                // submitted -> analyzing -> verified; escalated proofs need
                // an admin actor.
                let admin = admin_id.is_some();
                let mut state = current;
                if state == ProofState::Submitted {
                    check_proof_transition(state, ProofState::Analyzing, admin)?;
                    state = ProofState::Analyzing;
                }
                check_proof_transition(state, ProofState::Verified, admin)?;

                sqlx::query(
                    r#"
                    UPDATE proofs SET state = 'verified', decided_at = NOW()
                    WHERE task_id = $1 AND state IN ('submitted', 'analyzing', 'escalated')
                    "#,
                )
                .bind(task_id)
                .execute(&mut **tx)
                .await?;
                state_machine::record_transition(
                    tx,
                    "proof",
                    task_id,
                    current.as_str(),
                    ProofState::Verified.as_str(),
                    json!({ "admin_id": admin_id }),
                )
                .await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    async fn try_trust_upgrade(&self, task_id: Uuid) -> CoreResult<()> {
        let trust = self.trust.clone();
        run_serializable(&self.pool, move |tx| {
            let trust = trust.clone();
            async move {
                let task = load_task_for_update(tx, task_id).await?;
                if let Some(worker_id) = task.worker_id {
                    trust.evaluate_upgrade(tx, worker_id, task_id).await?;
                }
                Ok(())
            }
            .boxed()
        })
        .await
    }
}
