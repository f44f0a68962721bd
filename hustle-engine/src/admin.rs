//! Admin and recovery controls
//!
//! Force-payout and force-refund run the regular saga protocol with the
//! `next_allowed_events` guard bypassed; every admin action lands one
//! deletion-forbidden row in `admin_action_ledger`, and the denylist is
//! checked before anything else regardless of token validity.

use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use hustle_core::{ids, CoreError, CoreResult};

use crate::{
    safety::{Denylist, SafetyControls},
    saga::{PaymentSaga, SagaAction, SagaOutcome, SagaRequest},
    stripe::StripeClient,
    tasks,
};

/// What a backfill run did, per provider object.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackfillReport {
    pub task_id: Uuid,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

/// Privileged operations surface.
#[derive(Clone)]
pub struct AdminService {
    pool: PgPool,
    saga: Arc<PaymentSaga>,
    stripe: Arc<StripeClient>,
    denylist: Denylist,
    safety: SafetyControls,
}

impl AdminService {
    pub fn new(
        pool: PgPool,
        saga: Arc<PaymentSaga>,
        stripe: Arc<StripeClient>,
        denylist: Denylist,
        safety: SafetyControls,
    ) -> Self {
        Self {
            pool,
            saga,
            stripe,
            denylist,
            safety,
        }
    }

    /// Force a payout past the event guard. State-machine and ledger
    /// invariants still apply in full.
    pub async fn force_payout(
        &self,
        admin_id: Uuid,
        task_id: Uuid,
        reason: &str,
    ) -> CoreResult<SagaOutcome> {
        self.guard(admin_id).await?;

        let result = self
            .saga
            .execute(SagaRequest {
                task_id,
                action: SagaAction::ReleasePayout,
                payload: json!({ "reason": reason, "forced_by": admin_id }),
                event_id: ids::new_ulid().to_string(),
                admin_override: Some(admin_id),
            })
            .await;

        self.audit(
            admin_id,
            "force_payout",
            "task",
            &task_id.to_string(),
            json!({
                "reason": reason,
                "outcome": outcome_label(&result),
            }),
        )
        .await?;
        result
    }

    /// Force a refund past the event guard.
    pub async fn force_refund(
        &self,
        admin_id: Uuid,
        task_id: Uuid,
        reason: &str,
    ) -> CoreResult<SagaOutcome> {
        self.guard(admin_id).await?;

        let result = self
            .saga
            .execute(SagaRequest {
                task_id,
                action: SagaAction::RefundEscrow,
                payload: json!({ "reason": reason, "forced_by": admin_id }),
                event_id: ids::new_ulid().to_string(),
                admin_override: Some(admin_id),
            })
            .await;

        self.audit(
            admin_id,
            "force_refund",
            "task",
            &task_id.to_string(),
            json!({
                "reason": reason,
                "outcome": outcome_label(&result),
            }),
        )
        .await?;
        result
    }

    pub async fn denylist_add(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        reason: &str,
        emergency: bool,
    ) -> CoreResult<()> {
        self.guard(admin_id).await?;
        self.denylist.deny(user_id, reason, emergency).await?;
        self.audit(
            admin_id,
            "denylist_add",
            "user",
            &user_id.to_string(),
            json!({ "reason": reason, "emergency": emergency }),
        )
        .await
    }

    pub async fn denylist_remove(&self, admin_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        self.guard(admin_id).await?;
        self.denylist.allow(user_id).await?;
        self.audit(
            admin_id,
            "denylist_remove",
            "user",
            &user_id.to_string(),
            json!({}),
        )
        .await
    }

    pub async fn set_killswitch(&self, admin_id: Uuid, active: bool, reason: &str) -> CoreResult<()> {
        self.guard(admin_id).await?;
        if active {
            self.safety.engage_killswitch(reason).await?;
        } else {
            self.safety.disengage_killswitch().await?;
        }
        self.audit(
            admin_id,
            "killswitch",
            "system",
            "killswitch",
            json!({ "active": active, "reason": reason }),
        )
        .await
    }

    /// Rebuild a task's ledger from the provider's record by replaying the
    /// corresponding saga actions with stable idempotency keys. Already
    /// applied actions replay or reject cleanly; invariants apply as normal.
    pub async fn backfill(&self, admin_id: Uuid, task_id: Uuid) -> CoreResult<BackfillReport> {
        self.guard(admin_id).await?;

        let mut report = BackfillReport {
            task_id,
            applied: Vec::new(),
            skipped: Vec::new(),
        };

        let escrow = {
            let mut tx = self.pool.begin().await?;
            let escrow = tasks::load_escrow_for_update(&mut tx, task_id).await?;
            tx.commit().await?;
            escrow
        };
        let Some(pi_id) = escrow.stripe_payment_intent_id.clone() else {
            return Err(CoreError::validation(
                "no_payment_intent",
                "escrow has no provider intent to backfill from",
            ));
        };

        // Funding truth.
        let intent = self.stripe.retrieve_payment_intent(&pi_id).await?;
        if intent.status.as_deref() == Some("succeeded") {
            let req = SagaRequest {
                task_id,
                action: SagaAction::HoldEscrow,
                payload: json!({
                    "payment_intent_id": pi_id,
                    "charge_id": intent.latest_charge,
                }),
                event_id: format!("backfill-hold-{pi_id}"),
                admin_override: Some(admin_id),
            };
            record_step(&mut report, "HOLD_ESCROW", self.saga.execute(req).await)?;
        }

        // Payout truth: adopt provider transfers instead of re-calling.
        for transfer in self.stripe.transfers_for_task(task_id).await? {
            let req = SagaRequest {
                task_id,
                action: SagaAction::ReleasePayout,
                payload: json!({ "backfilled_from": transfer.id }),
                event_id: format!("backfill-transfer-{}", transfer.id),
                admin_override: Some(admin_id),
            };
            record_step(
                &mut report,
                "RELEASE_PAYOUT",
                self.saga.execute_adopted(req, transfer.id.clone()).await,
            )?;
        }

        // Refund truth.
        if let Some(refund) = self.stripe.refunds_for_intent(&pi_id).await?.into_iter().next() {
            let req = SagaRequest {
                task_id,
                action: SagaAction::RefundEscrow,
                payload: json!({ "backfilled_from": refund.id }),
                event_id: format!("backfill-refund-{}", refund.id),
                admin_override: Some(admin_id),
            };
            record_step(
                &mut report,
                "REFUND_ESCROW",
                self.saga.execute_adopted(req, refund.id.clone()).await,
            )?;
        }

        self.audit(
            admin_id,
            "backfill",
            "task",
            &task_id.to_string(),
            serde_json::to_value(&report)?,
        )
        .await?;
        info!(%task_id, applied = report.applied.len(), "backfill finished");
        Ok(report)
    }

    async fn guard(&self, admin_id: Uuid) -> CoreResult<()> {
        if self.denylist.is_denied(admin_id).await? {
            return Err(CoreError::validation(
                "admin_denied",
                format!("admin {admin_id} is denylisted"),
            ));
        }
        Ok(())
    }

    async fn audit(
        &self,
        admin_id: Uuid,
        action: &str,
        target_type: &str,
        target_id: &str,
        context: serde_json::Value,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_action_ledger (admin_id, action, target_type, target_id, context)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(admin_id)
        .bind(action)
        .bind(target_type)
        .bind(target_id)
        .bind(&context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn outcome_label(result: &CoreResult<SagaOutcome>) -> String {
    match result {
        Ok(outcome) if outcome.replayed => "replayed".to_string(),
        Ok(_) => "committed".to_string(),
        Err(err) => format!("failed:{}", err.code()),
    }
}

/// A backfill step that rejects with an illegal transition just means the
/// ledger already reflects that provider object.
fn record_step(
    report: &mut BackfillReport,
    label: &str,
    result: CoreResult<SagaOutcome>,
) -> CoreResult<()> {
    match result {
        Ok(outcome) if outcome.replayed => {
            report.skipped.push(format!("{label}: already recorded"));
            Ok(())
        }
        Ok(_) => {
            report.applied.push(label.to_string());
            Ok(())
        }
        Err(CoreError::IllegalTransition { .. }) | Err(CoreError::ConcurrencyConflict(_)) => {
            report.skipped.push(format!("{label}: state already advanced"));
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_step_classification() {
        let mut report = BackfillReport {
            task_id: Uuid::nil(),
            applied: vec![],
            skipped: vec![],
        };

        record_step(
            &mut report,
            "RELEASE_PAYOUT",
            Ok(SagaOutcome {
                ledger_tx_id: Some("01A".into()),
                provider_ref: Some("tr_1".into()),
                replayed: false,
            }),
        )
        .unwrap();
        record_step(
            &mut report,
            "HOLD_ESCROW",
            Err(CoreError::illegal_transition(
                "escrow", "released", "HOLD_ESCROW", "done",
            )),
        )
        .unwrap();

        assert_eq!(report.applied, vec!["RELEASE_PAYOUT"]);
        assert_eq!(report.skipped.len(), 1);

        // Real failures propagate.
        assert!(record_step(
            &mut report,
            "REFUND_ESCROW",
            Err(CoreError::Storage("db down".into()))
        )
        .is_err());
    }
}
