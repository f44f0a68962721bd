//! Payment saga engine
//!
//! One saga run orchestrates a single business money event across the
//! ledger, the external payment provider, and the outbox:
//!
//! 1. guard: `money_state_lock FOR UPDATE`, action must be allowed
//! 2. prepare: ledger transaction lands `pending` with a deterministic
//!    idempotency key `action:task_id:event_id`
//! 3. set executing
//! 4. provider call keyed by the ledger ULID
//! 5. commit (state advance + ledger commit + outbox + XP) or mark failed
//!    and spill to the DLQ
//!
//! Steps 1–3 are one database transaction and steps 5a/5b another, so a
//! crash between them leaves an `executing` row that the recovery sweep
//! resolves from provider truth. Replays short-circuit on the idempotency
//! key and return the original result.

use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use hustle_core::{ids, retry::run_serializable, CoreError, CoreResult};
use hustle_ledger::{
    models::templates, AccountOwner, EntryDirection, EntryInput, LedgerService, PgTx,
    TransactionInput, TxStatus,
};

use crate::{
    alerting::AlertService,
    lock_manager::LockManager,
    metrics::CoreMetrics,
    outbox::{queues, OutboxClient, OutboxEventInput},
    safety::SafetyControls,
    state_machine::{
        self, check_escrow_transition, check_task_transition, EscrowState, TaskGuardContext,
        TaskState,
    },
    stripe::StripeClient,
    tasks::{latest_proof, load_escrow_for_update, load_task_for_update, EscrowRecord, TaskRecord},
    xp::XpService,
};

use std::sync::Arc;

const RING_LOCK_TTL: Duration = Duration::from_secs(60);

/// The business money events a saga can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaAction {
    HoldEscrow,
    Capture,
    ReleasePayout,
    RefundEscrow,
    DisputeOpen,
    DisputeResolve,
}

impl SagaAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HoldEscrow => "HOLD_ESCROW",
            Self::Capture => "CAPTURE",
            Self::ReleasePayout => "RELEASE_PAYOUT",
            Self::RefundEscrow => "REFUND_ESCROW",
            Self::DisputeOpen => "DISPUTE_OPEN",
            Self::DisputeResolve => "DISPUTE_RESOLVE",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "HOLD_ESCROW" => Ok(Self::HoldEscrow),
            "CAPTURE" => Ok(Self::Capture),
            "RELEASE_PAYOUT" => Ok(Self::ReleasePayout),
            "REFUND_ESCROW" => Ok(Self::RefundEscrow),
            "DISPUTE_OPEN" => Ok(Self::DisputeOpen),
            "DISPUTE_RESOLVE" => Ok(Self::DisputeResolve),
            other => Err(CoreError::validation(
                "bad_action",
                format!("unknown saga action {other}"),
            )),
        }
    }

    /// Killswitch-gated: everything that can end up moving money.
    pub fn moves_money(&self) -> bool {
        !matches!(self, Self::DisputeOpen)
    }

    /// Whether this action writes double-entry rows.
    pub fn has_entries(&self) -> bool {
        matches!(
            self,
            Self::HoldEscrow | Self::ReleasePayout | Self::RefundEscrow | Self::DisputeResolve
        )
    }
}

/// One saga invocation. `event_id` is the caller-supplied ULID that makes
/// the run idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRequest {
    pub task_id: Uuid,
    pub action: SagaAction,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub event_id: String,
    /// Admin force actions bypass the `next_allowed_events` guard (audited
    /// by the caller); state-machine and ledger invariants still apply.
    #[serde(default)]
    pub admin_override: Option<Uuid>,
}

/// Committed saga result.
#[derive(Debug, Clone, Serialize)]
pub struct SagaOutcome {
    pub ledger_tx_id: Option<String>,
    pub provider_ref: Option<String>,
    pub replayed: bool,
}

/// Dispute resolutions accepted in `DisputeResolve` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Release,
    Refund,
}

impl Resolution {
    fn from_payload(payload: &serde_json::Value) -> CoreResult<Self> {
        match payload.get("resolution").and_then(|v| v.as_str()) {
            Some("release") => Ok(Self::Release),
            Some("refund") => Ok(Self::Refund),
            other => Err(CoreError::validation(
                "bad_resolution",
                format!("resolution must be release or refund, got {other:?}"),
            )),
        }
    }
}

/// Everything the post-provider commit phase needs, captured at prepare.
#[derive(Debug, Clone)]
struct SagaPlan {
    action: SagaAction,
    task_id: Uuid,
    event_id: String,
    idempotency_key: String,
    ledger_tx_id: Option<String>,
    amount_cents: i64,
    worker_id: Option<Uuid>,
    payment_intent_id: Option<String>,
    destination: Option<String>,
    resolution: Option<Resolution>,
    payload: serde_json::Value,
}

enum Prepared {
    Replayed(SagaOutcome),
    Proceed(Box<SagaPlan>),
}

/// The saga engine. Holds its collaborators by value; there are no ambient
/// singletons anywhere in the money path.
#[derive(Clone)]
pub struct PaymentSaga {
    pool: PgPool,
    ledger: LedgerService,
    outbox: OutboxClient,
    xp: XpService,
    stripe: Arc<StripeClient>,
    locks: LockManager,
    safety: SafetyControls,
    alerts: AlertService,
    metrics: Arc<CoreMetrics>,
    payouts_enabled: bool,
}

impl PaymentSaga {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        ledger: LedgerService,
        outbox: OutboxClient,
        xp: XpService,
        stripe: Arc<StripeClient>,
        locks: LockManager,
        safety: SafetyControls,
        alerts: AlertService,
        metrics: Arc<CoreMetrics>,
        payouts_enabled: bool,
    ) -> Self {
        Self {
            pool,
            ledger,
            outbox,
            xp,
            stripe,
            locks,
            safety,
            alerts,
            metrics,
            payouts_enabled,
        }
    }

    /// Run one saga to completion (or typed failure).
    pub async fn execute(&self, req: SagaRequest) -> CoreResult<SagaOutcome> {
        if req.action.moves_money() {
            if let Err(err) = self.safety.require_money_allowed().await {
                self.route_to_dlq(&req, "killswitch active").await?;
                return Err(err);
            }
        }

        let _lease = self.locks.acquire(
            &format!("task:{}", req.task_id),
            &req.event_id,
            RING_LOCK_TTL,
        )?;

        let plan = match self.prepare_phase(&req).await {
            Ok(Prepared::Replayed(outcome)) => return Ok(outcome),
            Ok(Prepared::Proceed(plan)) => *plan,
            Err(err) => {
                if matches!(err, CoreError::ConcurrencyConflict(_)) {
                    self.metrics
                        .saga_retries
                        .with_label_values(&[req.action.as_str()])
                        .inc();
                }
                return Err(err);
            }
        };

        let provider_ref = match self.provider_phase(&plan).await {
            Ok(provider_ref) => provider_ref,
            Err(err) => {
                self.metrics
                    .saga_failures
                    .with_label_values(&[plan.action.as_str()])
                    .inc();
                if err.is_retriable() {
                    // Ambiguous outcome (timeout, 5xx, open circuit): the
                    // provider may have executed the call. Leave the ledger
                    // row executing; the stuck-recovery sweep resolves it
                    // from provider truth instead of risking a double spend.
                    warn!(
                        task_id = %plan.task_id,
                        action = plan.action.as_str(),
                        error = %err,
                        "provider call ambiguous; left for recovery"
                    );
                    return Err(err);
                }
                self.fail_phase(&plan, &err).await?;
                return Err(err);
            }
        };

        match self.commit_phase(&plan, provider_ref.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The provider side effect exists; never roll it back here.
                // The stuck-recovery sweep will re-drive the commit.
                self.metrics.observe_error(&err);
                self.alerts
                    .critical(
                        "saga commit failed after provider call",
                        json!({
                            "task_id": plan.task_id,
                            "action": plan.action.as_str(),
                            "ledger_tx": plan.ledger_tx_id,
                            "provider_ref": provider_ref,
                            "error": err.to_string(),
                        }),
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// Run a saga whose provider side effect already exists (admin backfill
    /// from provider truth). Identical protocol, but the provider phase is
    /// replaced by the given reference.
    pub async fn execute_adopted(
        &self,
        req: SagaRequest,
        provider_ref: String,
    ) -> CoreResult<SagaOutcome> {
        let _lease = self.locks.acquire(
            &format!("task:{}", req.task_id),
            &req.event_id,
            RING_LOCK_TTL,
        )?;

        let plan = match self.prepare_phase(&req).await? {
            Prepared::Replayed(outcome) => return Ok(outcome),
            Prepared::Proceed(plan) => *plan,
        };
        self.commit_phase(&plan, Some(provider_ref)).await
    }

    // ── Phase 1-3: guard + prepare + set executing ────────────────────────

    async fn prepare_phase(&self, req: &SagaRequest) -> CoreResult<Prepared> {
        let ledger = self.ledger.clone();
        let req = req.clone();
        run_serializable(&self.pool, move |tx| {
            let ledger = ledger.clone();
            let req = req.clone();
            async move { prepare_in_tx(&ledger, tx, &req).await }.boxed()
        })
        .await
    }

    // ── Phase 4: external provider call ───────────────────────────────────

    async fn provider_phase(&self, plan: &SagaPlan) -> CoreResult<Option<String>> {
        match (plan.action, plan.resolution) {
            (SagaAction::HoldEscrow, _) | (SagaAction::DisputeOpen, _) => {
                // Funds already moved provider-side (or nothing moves);
                // the webhook that triggered us is the provider truth.
                Ok(plan.payload.get("payment_intent_id").and_then(|v| v.as_str()).map(String::from))
            }
            (SagaAction::Capture, _) => {
                let pi = plan.payment_intent_id.as_deref().ok_or_else(|| {
                    CoreError::validation("missing_payment_intent", "capture needs a payment intent")
                })?;
                let object = self
                    .stripe
                    .capture_payment_intent(pi, &plan.idempotency_key)
                    .await?;
                Ok(Some(object.id))
            }
            (SagaAction::ReleasePayout, _) | (SagaAction::DisputeResolve, Some(Resolution::Release)) => {
                if !self.payouts_enabled {
                    return Err(CoreError::provider(
                        "stripe",
                        "outbound payouts are disabled (PAYOUTS_ENABLED=false)",
                        false,
                    ));
                }
                let ledger_tx = plan.ledger_tx_id.as_deref().ok_or_else(|| {
                    CoreError::Storage("release plan missing ledger tx".to_string())
                })?;
                let destination = plan.destination.as_deref().ok_or_else(|| {
                    CoreError::validation(
                        "missing_destination",
                        "worker has no payout account on file",
                    )
                })?;
                let object = self
                    .stripe
                    .create_transfer(plan.amount_cents, destination, plan.task_id, ledger_tx)
                    .await?;
                Ok(Some(object.id))
            }
            (SagaAction::RefundEscrow, _) | (SagaAction::DisputeResolve, Some(Resolution::Refund)) => {
                let ledger_tx = plan.ledger_tx_id.as_deref().ok_or_else(|| {
                    CoreError::Storage("refund plan missing ledger tx".to_string())
                })?;
                let pi = plan.payment_intent_id.as_deref().ok_or_else(|| {
                    CoreError::validation("missing_payment_intent", "refund needs a payment intent")
                })?;
                let object = self.stripe.create_refund(pi, plan.task_id, ledger_tx).await?;
                Ok(Some(object.id))
            }
            (SagaAction::DisputeResolve, None) => Err(CoreError::validation(
                "bad_resolution",
                "dispute resolution missing",
            )),
        }
    }

    // ── Phase 5a: commit ──────────────────────────────────────────────────

    async fn commit_phase(
        &self,
        plan: &SagaPlan,
        provider_ref: Option<String>,
    ) -> CoreResult<SagaOutcome> {
        let this = self.clone();
        let plan_c = plan.clone();
        let outcome = run_serializable(&self.pool, move |tx| {
            let this = this.clone();
            let plan = plan_c.clone();
            let provider_ref = provider_ref.clone();
            async move { this.commit_in_tx(tx, &plan, provider_ref).await }.boxed()
        })
        .await?;

        info!(
            task_id = %plan.task_id,
            action = plan.action.as_str(),
            ledger_tx = ?outcome.ledger_tx_id,
            provider_ref = ?outcome.provider_ref,
            "saga committed"
        );
        Ok(outcome)
    }

    async fn commit_in_tx(
        &self,
        tx: &mut PgTx<'_>,
        plan: &SagaPlan,
        provider_ref: Option<String>,
    ) -> CoreResult<SagaOutcome> {
        // Re-take the storage lock; phase 1's hold ended with its transaction.
        state_machine::lock_money_state(tx, plan.task_id).await?;

        if let (Some(provider_id), Some(ledger_tx_id)) = (&provider_ref, &plan.ledger_tx_id) {
            record_outbound(tx, ledger_tx_id, provider_id, plan.action.as_str()).await?;
        } else if let Some(provider_id) = &provider_ref {
            record_outbound(tx, &plan.idempotency_key, provider_id, plan.action.as_str()).await?;
        }

        match (plan.action, plan.resolution) {
            (SagaAction::HoldEscrow, _) => self.commit_hold(tx, plan, &provider_ref).await?,
            (SagaAction::Capture, _) => {
                // Capture only arms the provider side; the succeeded webhook
                // will drive HOLD_ESCROW.
            }
            (SagaAction::ReleasePayout, _)
            | (SagaAction::DisputeResolve, Some(Resolution::Release)) => {
                self.commit_release(tx, plan, &provider_ref).await?
            }
            (SagaAction::RefundEscrow, _)
            | (SagaAction::DisputeResolve, Some(Resolution::Refund)) => {
                self.commit_refund(tx, plan, &provider_ref).await?
            }
            (SagaAction::DisputeOpen, _) => self.commit_dispute_open(tx, plan).await?,
            (SagaAction::DisputeResolve, None) => {
                return Err(CoreError::validation(
                    "bad_resolution",
                    "dispute resolution missing",
                ))
            }
        }

        Ok(SagaOutcome {
            ledger_tx_id: plan.ledger_tx_id.clone(),
            provider_ref,
            replayed: false,
        })
    }

    async fn commit_hold(
        &self,
        tx: &mut PgTx<'_>,
        plan: &SagaPlan,
        provider_ref: &Option<String>,
    ) -> CoreResult<()> {
        let escrow = load_escrow_for_update(tx, plan.task_id).await?;
        check_escrow_transition(escrow.state, EscrowState::Funded)?;

        let charge_id = plan.payload.get("charge_id").and_then(|v| v.as_str());
        sqlx::query(
            r#"
            UPDATE escrows
            SET state = 'funded',
                stripe_payment_intent_id = COALESCE($2, stripe_payment_intent_id),
                stripe_charge_id = COALESCE($3, stripe_charge_id),
                version = version + 1,
                updated_at = NOW()
            WHERE task_id = $1
            "#,
        )
        .bind(plan.task_id)
        .bind(plan.payment_intent_id.as_deref())
        .bind(charge_id)
        .execute(&mut **tx)
        .await?;

        state_machine::record_transition(
            tx,
            "escrow",
            plan.task_id,
            escrow.state.as_str(),
            EscrowState::Funded.as_str(),
            json!({ "payment_intent": plan.payment_intent_id }),
        )
        .await?;
        state_machine::advance_money_state(tx, plan.task_id, EscrowState::Funded).await?;

        if let Some(ledger_tx_id) = &plan.ledger_tx_id {
            self.ledger
                .commit(tx, ledger_tx_id, json!({ "provider_ref": provider_ref }))
                .await?;
        }

        self.outbox
            .enqueue(
                tx,
                OutboxEventInput {
                    aggregate_type: "escrow",
                    aggregate_id: plan.task_id,
                    event_type: "escrow.funded",
                    payload: json!({
                        "task_id": plan.task_id,
                        "amount_cents": plan.amount_cents,
                    }),
                    queue: queues::CRITICAL_PAYMENTS,
                    idempotency_key: format!("outbox:{}", plan.idempotency_key),
                },
            )
            .await
    }

    async fn commit_release(
        &self,
        tx: &mut PgTx<'_>,
        plan: &SagaPlan,
        provider_ref: &Option<String>,
    ) -> CoreResult<()> {
        let task = load_task_for_update(tx, plan.task_id).await?;
        let escrow = load_escrow_for_update(tx, plan.task_id).await?;
        check_escrow_transition(escrow.state, EscrowState::Released)?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(plan.task_id)
        .execute(&mut **tx)
        .await?;
        state_machine::record_transition(
            tx,
            "task",
            plan.task_id,
            task.state.as_str(),
            TaskState::Completed.as_str(),
            json!({ "event_id": plan.idempotency_key }),
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE escrows
            SET state = 'released', version = version + 1, updated_at = NOW()
            WHERE task_id = $1
            "#,
        )
        .bind(plan.task_id)
        .execute(&mut **tx)
        .await?;
        state_machine::record_transition(
            tx,
            "escrow",
            plan.task_id,
            escrow.state.as_str(),
            EscrowState::Released.as_str(),
            json!({ "provider_ref": provider_ref }),
        )
        .await?;
        state_machine::advance_money_state(tx, plan.task_id, EscrowState::Released).await?;

        // A dispute resolved in the worker's favor accepts the pending proof
        // under the admin's authority before completion.
        if plan.resolution == Some(Resolution::Release) {
            sqlx::query(
                r#"
                UPDATE proofs SET state = 'verified', decided_at = NOW()
                WHERE task_id = $1 AND state IN ('submitted', 'analyzing', 'escalated')
                "#,
            )
            .bind(plan.task_id)
            .execute(&mut **tx)
            .await?;
        }

        // Lock the verified proof so the chain of evidence is frozen.
        sqlx::query(
            "UPDATE proofs SET state = 'locked', decided_at = NOW() WHERE task_id = $1 AND state = 'verified'",
        )
        .bind(plan.task_id)
        .execute(&mut **tx)
        .await?;

        let ledger_tx_id = plan
            .ledger_tx_id
            .as_deref()
            .ok_or_else(|| CoreError::Storage("release missing ledger tx".to_string()))?;
        self.ledger
            .commit(tx, ledger_tx_id, json!({ "provider_ref": provider_ref }))
            .await?;

        let worker_id = plan
            .worker_id
            .ok_or_else(|| CoreError::Storage("release missing worker".to_string()))?;
        let award = self
            .xp
            .award_for_escrow(tx, worker_id, plan.task_id, plan.amount_cents)
            .await?;
        sqlx::query("UPDATE users SET completed_tasks = completed_tasks + 1 WHERE id = $1")
            .bind(worker_id)
            .execute(&mut **tx)
            .await?;

        self.outbox
            .enqueue(
                tx,
                OutboxEventInput {
                    aggregate_type: "task",
                    aggregate_id: plan.task_id,
                    event_type: "task.completed",
                    payload: json!({
                        "task_id": plan.task_id,
                        "worker_id": worker_id,
                        "price_cents": plan.amount_cents,
                    }),
                    queue: queues::CRITICAL_PAYMENTS,
                    idempotency_key: format!("outbox:task:{}", plan.idempotency_key),
                },
            )
            .await?;
        self.outbox
            .enqueue(
                tx,
                OutboxEventInput {
                    aggregate_type: "escrow",
                    aggregate_id: plan.task_id,
                    event_type: "escrow.released",
                    payload: json!({
                        "task_id": plan.task_id,
                        "amount_cents": plan.amount_cents,
                        "provider_ref": provider_ref,
                    }),
                    queue: queues::CRITICAL_PAYMENTS,
                    idempotency_key: format!("outbox:escrow:{}", plan.idempotency_key),
                },
            )
            .await?;
        self.outbox
            .enqueue(
                tx,
                OutboxEventInput {
                    aggregate_type: "user",
                    aggregate_id: worker_id,
                    event_type: "xp.awarded",
                    payload: json!({
                        "task_id": plan.task_id,
                        "final_xp": award.final_xp,
                    }),
                    queue: queues::USER_NOTIFICATIONS,
                    idempotency_key: format!("outbox:xp:{}", plan.idempotency_key),
                },
            )
            .await
    }

    async fn commit_refund(
        &self,
        tx: &mut PgTx<'_>,
        plan: &SagaPlan,
        provider_ref: &Option<String>,
    ) -> CoreResult<()> {
        let task = load_task_for_update(tx, plan.task_id).await?;
        let escrow = load_escrow_for_update(tx, plan.task_id).await?;
        check_escrow_transition(escrow.state, EscrowState::Refunded)?;

        if !task.state.is_terminal() {
            sqlx::query("UPDATE tasks SET state = 'cancelled', updated_at = NOW() WHERE id = $1")
                .bind(plan.task_id)
                .execute(&mut **tx)
                .await?;
            state_machine::record_transition(
                tx,
                "task",
                plan.task_id,
                task.state.as_str(),
                TaskState::Cancelled.as_str(),
                json!({ "event_id": plan.idempotency_key }),
            )
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE escrows
            SET state = 'refunded', version = version + 1, updated_at = NOW()
            WHERE task_id = $1
            "#,
        )
        .bind(plan.task_id)
        .execute(&mut **tx)
        .await?;
        state_machine::record_transition(
            tx,
            "escrow",
            plan.task_id,
            escrow.state.as_str(),
            EscrowState::Refunded.as_str(),
            json!({ "provider_ref": provider_ref }),
        )
        .await?;
        state_machine::advance_money_state(tx, plan.task_id, EscrowState::Refunded).await?;

        let ledger_tx_id = plan
            .ledger_tx_id
            .as_deref()
            .ok_or_else(|| CoreError::Storage("refund missing ledger tx".to_string()))?;
        self.ledger
            .commit(tx, ledger_tx_id, json!({ "provider_ref": provider_ref }))
            .await?;

        self.outbox
            .enqueue(
                tx,
                OutboxEventInput {
                    aggregate_type: "escrow",
                    aggregate_id: plan.task_id,
                    event_type: "escrow.refunded",
                    payload: json!({
                        "task_id": plan.task_id,
                        "amount_cents": plan.amount_cents,
                        "provider_ref": provider_ref,
                    }),
                    queue: queues::CRITICAL_PAYMENTS,
                    idempotency_key: format!("outbox:{}", plan.idempotency_key),
                },
            )
            .await
    }

    async fn commit_dispute_open(&self, tx: &mut PgTx<'_>, plan: &SagaPlan) -> CoreResult<()> {
        let task = load_task_for_update(tx, plan.task_id).await?;
        let escrow = load_escrow_for_update(tx, plan.task_id).await?;
        check_escrow_transition(escrow.state, EscrowState::PendingDispute)?;

        sqlx::query("UPDATE tasks SET state = 'disputed', updated_at = NOW() WHERE id = $1")
            .bind(plan.task_id)
            .execute(&mut **tx)
            .await?;
        state_machine::record_transition(
            tx,
            "task",
            plan.task_id,
            task.state.as_str(),
            TaskState::Disputed.as_str(),
            plan.payload.clone(),
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE escrows
            SET state = 'pending_dispute', version = version + 1, updated_at = NOW()
            WHERE task_id = $1
            "#,
        )
        .bind(plan.task_id)
        .execute(&mut **tx)
        .await?;
        state_machine::record_transition(
            tx,
            "escrow",
            plan.task_id,
            escrow.state.as_str(),
            EscrowState::PendingDispute.as_str(),
            plan.payload.clone(),
        )
        .await?;
        state_machine::advance_money_state(tx, plan.task_id, EscrowState::PendingDispute).await?;

        self.outbox
            .enqueue(
                tx,
                OutboxEventInput {
                    aggregate_type: "task",
                    aggregate_id: plan.task_id,
                    event_type: "task.disputed",
                    payload: plan.payload.clone(),
                    queue: queues::USER_NOTIFICATIONS,
                    idempotency_key: format!("outbox:{}", plan.idempotency_key),
                },
            )
            .await
    }

    // ── Phase 5b: failure ─────────────────────────────────────────────────

    async fn fail_phase(&self, plan: &SagaPlan, cause: &CoreError) -> CoreResult<()> {
        let this = self.clone();
        let plan_c = plan.clone();
        let reason = cause.to_string();
        run_serializable(&self.pool, move |tx| {
            let this = this.clone();
            let plan = plan_c.clone();
            let reason = reason.clone();
            async move {
                if let Some(ledger_tx_id) = &plan.ledger_tx_id {
                    this.ledger.mark_failed(tx, ledger_tx_id, &reason).await?;
                }
                // The DLQ payload is a replayable SagaRequest.
                let request = SagaRequest {
                    task_id: plan.task_id,
                    action: plan.action,
                    payload: plan.payload.clone(),
                    event_id: plan.event_id.clone(),
                    admin_override: None,
                };
                insert_dlq(
                    tx,
                    queues::CRITICAL_PAYMENTS,
                    serde_json::to_value(&request)?,
                    &reason,
                )
                .await
            }
            .boxed()
        })
        .await?;

        warn!(
            task_id = %plan.task_id,
            action = plan.action.as_str(),
            error = %cause,
            "saga failed; routed to DLQ"
        );
        Ok(())
    }

    async fn route_to_dlq(&self, req: &SagaRequest, reason: &str) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_dlq(
            &mut tx,
            queues::CRITICAL_PAYMENTS,
            serde_json::to_value(req)?,
            reason,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ── Crash recovery ────────────────────────────────────────────────────

    /// Resolve ledger transactions stuck in `pending|executing` beyond the
    /// threshold: finish them when the provider already has the side effect,
    /// fail them otherwise. Returns (recovered, failed).
    pub async fn recover_stuck(&self, threshold_minutes: i64) -> CoreResult<(u32, u32)> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, metadata
            FROM ledger_transactions
            WHERE status IN ('pending', 'executing')
              AND created_at < NOW() - make_interval(mins => $1)
            ORDER BY created_at
            "#,
        )
        .bind(threshold_minutes as f64)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0u32;
        let mut failed = 0u32;

        for row in rows {
            let tx_id: String = row.try_get("id").map_err(CoreError::from)?;
            let status: String = row.try_get("status").map_err(CoreError::from)?;
            let metadata: serde_json::Value = row.try_get("metadata").map_err(CoreError::from)?;

            match self.recover_one(&tx_id, &status, &metadata).await {
                Ok(true) => recovered += 1,
                Ok(false) => failed += 1,
                Err(err) => {
                    warn!(tx_id, error = %err, "stuck saga recovery attempt failed");
                }
            }
        }

        if recovered + failed > 0 {
            info!(recovered, failed, "stuck saga sweep finished");
        }
        Ok((recovered, failed))
    }

    async fn recover_one(
        &self,
        tx_id: &str,
        status: &str,
        metadata: &serde_json::Value,
    ) -> CoreResult<bool> {
        let action = SagaAction::parse(
            metadata
                .get("action")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        )?;
        let task_id: Uuid = metadata
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoreError::Storage(format!("tx {tx_id} metadata missing task_id")))?;

        // Provider truth, cheapest source first: our own outbound log, then
        // the provider's search API.
        let outbound: Option<String> =
            sqlx::query_scalar("SELECT stripe_id FROM stripe_outbound_log WHERE idempotency_key = $1")
                .bind(tx_id)
                .fetch_optional(&self.pool)
                .await?;
        let provider_ref = match outbound {
            Some(id) => Some(id),
            None => match action {
                SagaAction::ReleasePayout | SagaAction::DisputeResolve => self
                    .stripe
                    .find_transfer_by_ledger_tx(tx_id)
                    .await?
                    .map(|o| o.id),
                SagaAction::RefundEscrow => {
                    let pi = metadata.get("payment_intent_id").and_then(|v| v.as_str());
                    match pi {
                        Some(pi) => self
                            .stripe
                            .find_refund_for_intent(pi, tx_id)
                            .await?
                            .map(|o| o.id),
                        None => None,
                    }
                }
                _ => None,
            },
        };

        let event_id = metadata
            .get("event_id")
            .and_then(|v| v.as_str())
            .unwrap_or(tx_id)
            .to_string();

        match provider_ref {
            Some(provider_ref) => {
                // The external side effect exists; finish the commit.
                if status == "pending" {
                    let ledger = self.ledger.clone();
                    let tx_id_owned = tx_id.to_string();
                    run_serializable(&self.pool, move |tx| {
                        let ledger = ledger.clone();
                        let tx_id = tx_id_owned.clone();
                        async move { ledger.set_executing(tx, &tx_id).await }.boxed()
                    })
                    .await?;
                }
                let plan = self
                    .rebuild_plan(action, task_id, tx_id, &event_id, metadata)
                    .await?;
                self.commit_phase(&plan, Some(provider_ref)).await?;
                Ok(true)
            }
            None => {
                self.fail_phase(
                    &self
                        .rebuild_plan(action, task_id, tx_id, &event_id, metadata)
                        .await?,
                    &CoreError::StuckRecovery(format!(
                        "tx {tx_id} stuck in {status} with no provider record"
                    )),
                )
                .await?;
                self.alerts
                    .warning(
                        "stuck saga transaction failed by recovery",
                        json!({ "ledger_tx": tx_id, "task_id": task_id }),
                    )
                    .await;
                Ok(false)
            }
        }
    }

    async fn rebuild_plan(
        &self,
        action: SagaAction,
        task_id: Uuid,
        ledger_tx_id: &str,
        event_id: &str,
        metadata: &serde_json::Value,
    ) -> CoreResult<SagaPlan> {
        let resolution = metadata
            .get("resolution")
            .and_then(|v| v.as_str())
            .and_then(|s| match s {
                "release" => Some(Resolution::Release),
                "refund" => Some(Resolution::Refund),
                _ => None,
            });
        let (amount_cents, worker_id, payment_intent_id, destination) =
            run_serializable(&self.pool, move |tx| {
                async move {
                    let escrow = load_escrow_for_update(tx, task_id).await?;
                    let task = load_task_for_update(tx, task_id).await?;
                    let destination = match task.worker_id {
                        Some(worker) => worker_destination(tx, worker).await?,
                        None => None,
                    };
                    Ok((
                        escrow.amount_cents,
                        task.worker_id,
                        escrow.stripe_payment_intent_id,
                        destination,
                    ))
                }
                .boxed()
            })
            .await?;

        Ok(SagaPlan {
            action,
            task_id,
            event_id: event_id.to_string(),
            idempotency_key: ids::saga_key(action.as_str(), &task_id, event_id),
            ledger_tx_id: Some(ledger_tx_id.to_string()),
            amount_cents,
            worker_id,
            payment_intent_id,
            destination,
            resolution,
            payload: metadata.clone(),
        })
    }
}

// ── Prepare internals (free functions so the retry closure stays light) ───

async fn prepare_in_tx(
    ledger: &LedgerService,
    tx: &mut PgTx<'_>,
    req: &SagaRequest,
) -> CoreResult<Prepared> {
    let msl = state_machine::lock_money_state(tx, req.task_id).await?;

    if !msl.allows(req.action) && req.admin_override.is_none() {
        state_machine::record_conflict(
            tx,
            "escrow",
            req.task_id,
            req.action.as_str(),
            msl.current_state.as_str(),
            "action not in next_allowed_events",
        )
        .await?;
        return Err(CoreError::illegal_transition(
            "escrow",
            msl.current_state.as_str().to_string(),
            req.action.as_str().to_string(),
            "action not in next_allowed_events".to_string(),
        ));
    }

    let idempotency_key = ids::saga_key(req.action.as_str(), &req.task_id, &req.event_id);
    let body_hash = ids::body_hash(serde_json::to_string(&req.payload)?.as_bytes());

    if let Some(existing) = ledger.find_by_idempotency_key(tx, &idempotency_key).await? {
        match existing.status {
            TxStatus::Committed | TxStatus::Confirmed => {
                LedgerService::replay_match(&existing, &idempotency_key, &body_hash)?;
                let provider_ref = existing
                    .metadata
                    .get("provider_ref")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                return Ok(Prepared::Replayed(SagaOutcome {
                    ledger_tx_id: Some(existing.id),
                    provider_ref,
                    replayed: true,
                }));
            }
            TxStatus::Pending | TxStatus::Executing => {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "saga {idempotency_key} is already in flight"
                )));
            }
            TxStatus::Failed => {
                let reason = existing
                    .metadata
                    .get("failure_reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("previous attempt failed");
                return Err(CoreError::provider("stripe", reason, false));
            }
        }
    }

    // One in-flight money event per (task, action): a concurrent run that
    // already prepared must finish or be recovered before another starts.
    let in_flight: Option<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM ledger_transactions
        WHERE tx_type = $1
          AND metadata->>'task_id' = $2
          AND status IN ('pending', 'executing')
        LIMIT 1
        "#,
    )
    .bind(req.action.as_str())
    .bind(req.task_id.to_string())
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(other) = in_flight {
        return Err(CoreError::ConcurrencyConflict(format!(
            "{} already in flight for task {} (ledger tx {other})",
            req.action.as_str(),
            req.task_id
        )));
    }

    let task = load_task_for_update(tx, req.task_id).await?;
    let escrow = load_escrow_for_update(tx, req.task_id).await?;
    let resolution = match req.action {
        SagaAction::DisputeResolve => Some(Resolution::from_payload(&req.payload)?),
        _ => None,
    };

    check_transition_guards(tx, req, &task, &escrow, resolution).await?;

    let destination = match task.worker_id {
        Some(worker) => worker_destination(tx, worker).await?,
        None => None,
    };
    let payment_intent_id = req
        .payload
        .get("payment_intent_id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or(escrow.stripe_payment_intent_id.clone());

    let mut plan = SagaPlan {
        action: req.action,
        task_id: req.task_id,
        event_id: req.event_id.clone(),
        idempotency_key: idempotency_key.clone(),
        ledger_tx_id: None,
        amount_cents: escrow.amount_cents,
        worker_id: task.worker_id,
        payment_intent_id: payment_intent_id.clone(),
        destination,
        resolution,
        payload: req.payload.clone(),
    };

    if req.action.has_entries() {
        let entries = build_entries(ledger, tx, &plan, &escrow).await?;
        let metadata = json!({
            "action": req.action.as_str(),
            "task_id": req.task_id,
            "event_id": req.event_id,
            "body_hash": body_hash,
            "payment_intent_id": payment_intent_id,
            "resolution": req.payload.get("resolution"),
            "admin_override": req.admin_override,
        });
        let prepared = ledger
            .prepare_transaction(
                tx,
                TransactionInput {
                    tx_type: req.action.as_str().to_string(),
                    idempotency_key,
                    currency: "USD".to_string(),
                    metadata,
                    entries,
                },
            )
            .await?;
        ledger.set_executing(tx, &prepared.id).await?;
        plan.ledger_tx_id = Some(prepared.id);
    }

    Ok(Prepared::Proceed(Box::new(plan)))
}

/// Run the task-side guards that must hold before the provider is touched.
async fn check_transition_guards(
    tx: &mut PgTx<'_>,
    req: &SagaRequest,
    task: &TaskRecord,
    escrow: &EscrowRecord,
    resolution: Option<Resolution>,
) -> CoreResult<()> {
    match (req.action, resolution) {
        (SagaAction::ReleasePayout, _) => {
            let proof = latest_proof(tx, req.task_id).await?;
            let ctx = TaskGuardContext {
                proof_state: proof,
                escrow_state: Some(escrow.state),
                admin_id: req.admin_override,
                worker_id: task.worker_id,
                ..Default::default()
            };
            check_task_transition(task.state, TaskState::Completed, &ctx)
        }
        (SagaAction::RefundEscrow, _) => {
            // Refund cancels the task when it is still cancellable.
            if task.state.is_terminal() {
                return Err(CoreError::illegal_transition(
                    "task",
                    task.state.as_str().to_string(),
                    TaskState::Cancelled.as_str().to_string(),
                    "task is terminal".to_string(),
                ));
            }
            if task.state == TaskState::ProofSubmitted && req.admin_override.is_none() {
                return Err(CoreError::illegal_transition(
                    "task",
                    task.state.as_str().to_string(),
                    TaskState::Cancelled.as_str().to_string(),
                    "open a dispute before refunding submitted work".to_string(),
                ));
            }
            if task.state == TaskState::Disputed && req.admin_override.is_none() {
                return Err(CoreError::illegal_transition(
                    "task",
                    task.state.as_str().to_string(),
                    TaskState::Cancelled.as_str().to_string(),
                    "disputed tasks are refunded by dispute resolution".to_string(),
                ));
            }
            Ok(())
        }
        (SagaAction::DisputeOpen, _) => {
            let ctx = TaskGuardContext {
                dispute_reason: req
                    .payload
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                ..Default::default()
            };
            check_task_transition(task.state, TaskState::Disputed, &ctx)
        }
        (SagaAction::DisputeResolve, Some(res)) => {
            let ctx = TaskGuardContext {
                admin_id: req.admin_override.or_else(|| {
                    req.payload
                        .get("admin_id")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                }),
                ..Default::default()
            };
            let to = match res {
                Resolution::Release => TaskState::Completed,
                Resolution::Refund => TaskState::Cancelled,
            };
            check_task_transition(task.state, to, &ctx)
        }
        _ => Ok(()),
    }
}

async fn build_entries(
    ledger: &LedgerService,
    tx: &mut PgTx<'_>,
    plan: &SagaPlan,
    escrow: &EscrowRecord,
) -> CoreResult<Vec<EntryInput>> {
    let escrow_account = ledger
        .get_or_create_account(tx, AccountOwner::Task(plan.task_id), templates::TASK_ESCROW)
        .await?;
    let platform_cash = ledger
        .get_or_create_account(tx, AccountOwner::Platform, templates::PLATFORM_CASH)
        .await?;

    let amount = escrow.amount_cents;
    let entries = match (plan.action, plan.resolution) {
        (SagaAction::HoldEscrow, _) => vec![
            EntryInput {
                account_id: platform_cash.id,
                direction: EntryDirection::Debit,
                amount_cents: amount,
            },
            EntryInput {
                account_id: escrow_account.id,
                direction: EntryDirection::Credit,
                amount_cents: amount,
            },
        ],
        (SagaAction::ReleasePayout, _) | (SagaAction::DisputeResolve, Some(Resolution::Release)) => {
            let worker = plan
                .worker_id
                .ok_or_else(|| CoreError::validation("missing_worker", "task has no worker"))?;
            let receivable = ledger
                .get_or_create_account(tx, AccountOwner::User(worker), templates::USER_RECEIVABLE)
                .await?;
            vec![
                EntryInput {
                    account_id: escrow_account.id,
                    direction: EntryDirection::Debit,
                    amount_cents: amount,
                },
                EntryInput {
                    account_id: receivable.id,
                    direction: EntryDirection::Credit,
                    amount_cents: amount,
                },
            ]
        }
        (SagaAction::RefundEscrow, _) | (SagaAction::DisputeResolve, Some(Resolution::Refund)) => {
            vec![
                EntryInput {
                    account_id: escrow_account.id,
                    direction: EntryDirection::Debit,
                    amount_cents: amount,
                },
                EntryInput {
                    account_id: platform_cash.id,
                    direction: EntryDirection::Credit,
                    amount_cents: amount,
                },
            ]
        }
        _ => vec![],
    };
    Ok(entries)
}

async fn worker_destination(tx: &mut PgTx<'_>, worker_id: Uuid) -> CoreResult<Option<String>> {
    let destination: Option<String> =
        sqlx::query_scalar("SELECT stripe_account_id FROM users WHERE id = $1")
            .bind(worker_id)
            .fetch_optional(&mut **tx)
            .await?
            .flatten();
    Ok(destination)
}

async fn record_outbound(
    tx: &mut PgTx<'_>,
    idempotency_key: &str,
    stripe_id: &str,
    request_type: &str,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO stripe_outbound_log (idempotency_key, stripe_id, request_type)
        VALUES ($1, $2, $3)
        ON CONFLICT (idempotency_key) DO NOTHING
        "#,
    )
    .bind(idempotency_key)
    .bind(stripe_id)
    .bind(request_type)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn insert_dlq(
    tx: &mut PgTx<'_>,
    queue: &str,
    payload: serde_json::Value,
    error: &str,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dead_letter_queue (queue, payload, last_error)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(queue)
    .bind(&payload)
    .bind(error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips() {
        for action in [
            SagaAction::HoldEscrow,
            SagaAction::Capture,
            SagaAction::ReleasePayout,
            SagaAction::RefundEscrow,
            SagaAction::DisputeOpen,
            SagaAction::DisputeResolve,
        ] {
            assert_eq!(SagaAction::parse(action.as_str()).unwrap(), action);
        }
        assert!(SagaAction::parse("PAY_EVERYONE").is_err());
    }

    #[test]
    fn money_and_entry_classification() {
        assert!(!SagaAction::DisputeOpen.moves_money());
        assert!(SagaAction::ReleasePayout.moves_money());
        assert!(SagaAction::Capture.moves_money());

        assert!(SagaAction::HoldEscrow.has_entries());
        assert!(SagaAction::ReleasePayout.has_entries());
        assert!(!SagaAction::Capture.has_entries());
        assert!(!SagaAction::DisputeOpen.has_entries());
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!(
            Resolution::from_payload(&json!({ "resolution": "release" })).unwrap(),
            Resolution::Release
        );
        assert_eq!(
            Resolution::from_payload(&json!({ "resolution": "refund" })).unwrap(),
            Resolution::Refund
        );
        assert!(Resolution::from_payload(&json!({})).is_err());
        assert!(Resolution::from_payload(&json!({ "resolution": "split" })).is_err());
    }
}
