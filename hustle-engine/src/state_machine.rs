//! Task, escrow, and proof state machines
//!
//! Each machine is a static transition table plus per-edge guards. Writers
//! hold the task's `money_state_lock` row (`SELECT ... FOR UPDATE`) for the
//! duration of the transition; every applied edge appends an append-only
//! `state_transition_log` row and bumps the lock's version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use hustle_core::{CoreError, CoreResult};
use hustle_ledger::PgTx;

use crate::saga::SagaAction;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Open,
    Accepted,
    ProofSubmitted,
    Disputed,
    Completed,
    Cancelled,
    Expired,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Accepted => "accepted",
            Self::ProofSubmitted => "proof_submitted",
            Self::Disputed => "disputed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "open" => Ok(Self::Open),
            "accepted" => Ok(Self::Accepted),
            "proof_submitted" => Ok(Self::ProofSubmitted),
            "disputed" => Ok(Self::Disputed),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(CoreError::Storage(format!("unknown task state {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }
}

/// Escrow lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    Pending,
    Funded,
    Held,
    Released,
    Refunded,
    PendingDispute,
}

impl EscrowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::Held => "held",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::PendingDispute => "pending_dispute",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "funded" => Ok(Self::Funded),
            "held" => Ok(Self::Held),
            "released" => Ok(Self::Released),
            "refunded" => Ok(Self::Refunded),
            "pending_dispute" => Ok(Self::PendingDispute),
            other => Err(CoreError::Storage(format!("unknown escrow state {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// The saga actions legal from this state; persisted into
    /// `money_state_lock.next_allowed_events`.
    pub fn next_allowed_events(&self) -> Vec<SagaAction> {
        match self {
            Self::Pending => vec![SagaAction::HoldEscrow],
            Self::Funded | Self::Held => vec![
                SagaAction::Capture,
                SagaAction::ReleasePayout,
                SagaAction::RefundEscrow,
                SagaAction::DisputeOpen,
            ],
            Self::PendingDispute => vec![SagaAction::DisputeResolve],
            Self::Released | Self::Refunded => vec![],
        }
    }
}

/// Proof lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofState {
    Requested,
    Submitted,
    Analyzing,
    Verified,
    Rejected,
    Escalated,
    Locked,
}

impl ProofState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Submitted => "submitted",
            Self::Analyzing => "analyzing",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::Escalated => "escalated",
            Self::Locked => "locked",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "requested" => Ok(Self::Requested),
            "submitted" => Ok(Self::Submitted),
            "analyzing" => Ok(Self::Analyzing),
            "verified" => Ok(Self::Verified),
            "rejected" => Ok(Self::Rejected),
            "escalated" => Ok(Self::Escalated),
            "locked" => Ok(Self::Locked),
            other => Err(CoreError::Storage(format!("unknown proof state {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// Guard context for a task transition; the machine only checks what the
/// edge requires.
#[derive(Debug, Clone, Default)]
pub struct TaskGuardContext {
    pub worker_id: Option<Uuid>,
    pub escrow_state: Option<EscrowState>,
    pub proof_state: Option<ProofState>,
    pub proof_id: Option<Uuid>,
    pub dispute_reason: Option<String>,
    pub admin_id: Option<Uuid>,
}

/// Whether the edge exists in the task transition table at all.
pub fn task_edge_exists(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Open, Accepted)
            | (Open, Cancelled)
            | (Open, Expired)
            | (Accepted, ProofSubmitted)
            | (Accepted, Cancelled)
            | (Accepted, Expired)
            | (ProofSubmitted, Completed)
            | (ProofSubmitted, Disputed)
            | (Disputed, Completed)
            | (Disputed, Cancelled)
    )
}

/// Validate one task transition with its guards.
pub fn check_task_transition(
    from: TaskState,
    to: TaskState,
    ctx: &TaskGuardContext,
) -> CoreResult<()> {
    let reject = |reason: &str| {
        Err(CoreError::illegal_transition(
            "task",
            from.as_str().to_string(),
            to.as_str().to_string(),
            reason.to_string(),
        ))
    };

    if from.is_terminal() {
        return reject("task is in a terminal state");
    }
    if !task_edge_exists(from, to) {
        return reject("no such transition");
    }

    use TaskState::*;
    match (from, to) {
        (Open, Accepted) => {
            if ctx.worker_id.is_none() {
                return reject("worker_id required");
            }
            if ctx.escrow_state != Some(EscrowState::Funded) {
                return reject("escrow must be funded");
            }
        }
        (Accepted, ProofSubmitted) => {
            if ctx.proof_id.is_none() {
                return reject("proof_id required");
            }
        }
        (ProofSubmitted, Completed) => {
            if ctx.proof_state != Some(ProofState::Verified) {
                return reject("proof must be verified");
            }
            if ctx.escrow_state != Some(EscrowState::Funded)
                && ctx.escrow_state != Some(EscrowState::Held)
                && ctx.escrow_state != Some(EscrowState::PendingDispute)
            {
                return reject("escrow must hold funds");
            }
        }
        (ProofSubmitted, Disputed) => {
            if ctx.dispute_reason.as_deref().unwrap_or("").trim().is_empty() {
                return reject("dispute reason required");
            }
        }
        (Disputed, Completed) | (Disputed, Cancelled) => {
            if ctx.admin_id.is_none() {
                return reject("admin_id required");
            }
        }
        _ => {}
    }
    Ok(())
}

/// Escrow transition table.
pub fn check_escrow_transition(from: EscrowState, to: EscrowState) -> CoreResult<()> {
    use EscrowState::*;
    let allowed = matches!(
        (from, to),
        (Pending, Funded)
            | (Funded, Held)
            | (Funded, Released)
            | (Funded, Refunded)
            | (Funded, PendingDispute)
            | (Held, Released)
            | (Held, Refunded)
            | (Held, PendingDispute)
            | (PendingDispute, Released)
            | (PendingDispute, Refunded)
    );
    if !allowed {
        return Err(CoreError::illegal_transition(
            "escrow",
            from.as_str().to_string(),
            to.as_str().to_string(),
            if from.is_terminal() {
                "escrow is in a terminal state".to_string()
            } else {
                "no such transition".to_string()
            },
        ));
    }
    Ok(())
}

/// Proof transition table; escalated edges require an admin actor.
pub fn check_proof_transition(from: ProofState, to: ProofState, admin: bool) -> CoreResult<()> {
    use ProofState::*;
    let allowed = match (from, to) {
        (Requested, Submitted) => true,
        (Submitted, Analyzing) => true,
        (Analyzing, Verified) | (Analyzing, Rejected) | (Analyzing, Escalated) => true,
        (Verified, Locked) => true,
        (Rejected, Requested) => true,
        (Escalated, Verified) | (Escalated, Rejected) => admin,
        _ => false,
    };
    if !allowed {
        return Err(CoreError::illegal_transition(
            "proof",
            from.as_str().to_string(),
            to.as_str().to_string(),
            if from == Escalated && !admin {
                "escalated proofs are decided by admins only".to_string()
            } else {
                "no such transition".to_string()
            },
        ));
    }
    Ok(())
}

/// The canonical money-status pointer row, read `FOR UPDATE`.
#[derive(Debug, Clone)]
pub struct MoneyStateLock {
    pub task_id: Uuid,
    pub current_state: EscrowState,
    pub next_allowed_events: Vec<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl MoneyStateLock {
    pub fn allows(&self, action: SagaAction) -> bool {
        self.next_allowed_events.iter().any(|e| e == action.as_str())
    }
}

/// Insert the lock row for a new task.
pub async fn init_money_state(tx: &mut PgTx<'_>, task_id: Uuid) -> CoreResult<()> {
    let events: Vec<String> = EscrowState::Pending
        .next_allowed_events()
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();
    sqlx::query(
        r#"
        INSERT INTO money_state_lock (task_id, current_state, next_allowed_events)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(task_id)
    .bind(EscrowState::Pending.as_str())
    .bind(&events)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// `SELECT ... FOR UPDATE` on the money pointer; all saga work happens
/// inside this hold.
pub async fn lock_money_state(tx: &mut PgTx<'_>, task_id: Uuid) -> CoreResult<MoneyStateLock> {
    let row = sqlx::query(
        r#"
        SELECT task_id, current_state, next_allowed_events, version, updated_at
        FROM money_state_lock
        WHERE task_id = $1
        FOR UPDATE
        "#,
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| CoreError::not_found("money_state_lock", task_id.to_string()))?;

    Ok(MoneyStateLock {
        task_id: row.try_get("task_id").map_err(CoreError::from)?,
        current_state: EscrowState::parse(
            row.try_get::<String, _>("current_state")
                .map_err(CoreError::from)?
                .as_str(),
        )?,
        next_allowed_events: row
            .try_get("next_allowed_events")
            .map_err(CoreError::from)?,
        version: row.try_get("version").map_err(CoreError::from)?,
        updated_at: row.try_get("updated_at").map_err(CoreError::from)?,
    })
}

/// Advance the money pointer and bump its version for optimistic readers.
pub async fn advance_money_state(
    tx: &mut PgTx<'_>,
    task_id: Uuid,
    to: EscrowState,
) -> CoreResult<()> {
    let events: Vec<String> = to
        .next_allowed_events()
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();
    sqlx::query(
        r#"
        UPDATE money_state_lock
        SET current_state = $2,
            next_allowed_events = $3,
            version = version + 1,
            updated_at = NOW()
        WHERE task_id = $1
        "#,
    )
    .bind(task_id)
    .bind(to.as_str())
    .bind(&events)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Append one row to the append-only transition log.
pub async fn record_transition(
    tx: &mut PgTx<'_>,
    entity_type: &str,
    entity_id: Uuid,
    from: &str,
    to: &str,
    context: serde_json::Value,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO state_transition_log (entity_type, entity_id, from_state, to_state, context)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(from)
    .bind(to)
    .bind(&context)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Append a rejected-transition row to the conflict log.
pub async fn record_conflict(
    tx: &mut PgTx<'_>,
    entity_type: &str,
    entity_id: Uuid,
    attempted_event: &str,
    from_state: &str,
    reason: &str,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO conflict_log (entity_type, entity_id, attempted_event, from_state, reason)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(attempted_event)
    .bind(from_state)
    .bind(reason)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded_ctx() -> TaskGuardContext {
        TaskGuardContext {
            worker_id: Some(Uuid::new_v4()),
            escrow_state: Some(EscrowState::Funded),
            ..Default::default()
        }
    }

    #[test]
    fn open_accept_needs_funded_escrow() {
        assert!(check_task_transition(TaskState::Open, TaskState::Accepted, &funded_ctx()).is_ok());

        let mut ctx = funded_ctx();
        ctx.escrow_state = Some(EscrowState::Pending);
        assert!(check_task_transition(TaskState::Open, TaskState::Accepted, &ctx).is_err());

        let mut ctx = funded_ctx();
        ctx.worker_id = None;
        assert!(check_task_transition(TaskState::Open, TaskState::Accepted, &ctx).is_err());
    }

    #[test]
    fn completion_needs_verified_proof() {
        let ctx = TaskGuardContext {
            proof_state: Some(ProofState::Verified),
            escrow_state: Some(EscrowState::Funded),
            ..Default::default()
        };
        assert!(
            check_task_transition(TaskState::ProofSubmitted, TaskState::Completed, &ctx).is_ok()
        );

        let rejected = TaskGuardContext {
            proof_state: Some(ProofState::Rejected),
            escrow_state: Some(EscrowState::Funded),
            ..Default::default()
        };
        assert!(
            check_task_transition(TaskState::ProofSubmitted, TaskState::Completed, &rejected)
                .is_err()
        );
    }

    #[test]
    fn terminal_tasks_reject_everything() {
        for terminal in [TaskState::Completed, TaskState::Cancelled, TaskState::Expired] {
            for to in [TaskState::Open, TaskState::Accepted, TaskState::Completed] {
                assert!(check_task_transition(terminal, to, &funded_ctx()).is_err());
            }
        }
    }

    #[test]
    fn dispute_needs_reason_and_admin_decides() {
        let no_reason = TaskGuardContext::default();
        assert!(
            check_task_transition(TaskState::ProofSubmitted, TaskState::Disputed, &no_reason)
                .is_err()
        );

        let with_reason = TaskGuardContext {
            dispute_reason: Some("work not delivered".into()),
            ..Default::default()
        };
        assert!(
            check_task_transition(TaskState::ProofSubmitted, TaskState::Disputed, &with_reason)
                .is_ok()
        );

        let no_admin = TaskGuardContext::default();
        assert!(
            check_task_transition(TaskState::Disputed, TaskState::Completed, &no_admin).is_err()
        );
        let admin = TaskGuardContext {
            admin_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert!(check_task_transition(TaskState::Disputed, TaskState::Cancelled, &admin).is_ok());
    }

    #[test]
    fn escrow_table() {
        use EscrowState::*;
        assert!(check_escrow_transition(Pending, Funded).is_ok());
        assert!(check_escrow_transition(Funded, Released).is_ok());
        assert!(check_escrow_transition(PendingDispute, Refunded).is_ok());

        assert!(check_escrow_transition(Pending, Released).is_err());
        assert!(check_escrow_transition(Released, Refunded).is_err());
        assert!(check_escrow_transition(Refunded, Funded).is_err());
    }

    #[test]
    fn proof_table_and_admin_edges() {
        use ProofState::*;
        assert!(check_proof_transition(Requested, Submitted, false).is_ok());
        assert!(check_proof_transition(Analyzing, Escalated, false).is_ok());
        assert!(check_proof_transition(Rejected, Requested, false).is_ok());
        assert!(check_proof_transition(Verified, Locked, false).is_ok());

        assert!(check_proof_transition(Escalated, Verified, false).is_err());
        assert!(check_proof_transition(Escalated, Verified, true).is_ok());
        assert!(check_proof_transition(Locked, Requested, true).is_err());
    }

    #[test]
    fn next_allowed_events_by_state() {
        let funded = EscrowState::Funded.next_allowed_events();
        assert!(funded.contains(&SagaAction::ReleasePayout));
        assert!(funded.contains(&SagaAction::RefundEscrow));
        assert!(EscrowState::Released.next_allowed_events().is_empty());
        assert_eq!(
            EscrowState::PendingDispute.next_allowed_events(),
            vec![SagaAction::DisputeResolve]
        );
    }
}
