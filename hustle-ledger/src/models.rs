//! Ledger data models
//!
//! Account identity is deterministic: an owner plus a template names exactly
//! one account row forever. Transactions are keyed by ULID so ordering per
//! account is causal, and their status machine is append-forward only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hustle_core::{ids, CoreError, CoreResult};

/// Well-known account templates.
pub mod templates {
    /// Platform operating cash (asset).
    pub const PLATFORM_CASH: &str = "platform_cash";
    /// Platform take-rate revenue (equity).
    pub const PLATFORM_REVENUE: &str = "platform_revenue";
    /// Per-task escrow liability.
    pub const TASK_ESCROW: &str = "task_escrow";
    /// Per-user payout receivable liability.
    pub const USER_RECEIVABLE: &str = "user_receivable";
}

/// Who an account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOwner {
    Platform,
    User(Uuid),
    Task(Uuid),
}

impl AccountOwner {
    /// Stable string fed into the deterministic account id hash.
    pub fn key(&self) -> String {
        match self {
            Self::Platform => "platform".to_string(),
            Self::User(id) => id.to_string(),
            Self::Task(id) => id.to_string(),
        }
    }

    pub fn owner_type(&self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::User(_) => "user",
            Self::Task(_) => "task",
        }
    }

    pub fn owner_id(&self) -> Option<Uuid> {
        match self {
            Self::Platform => None,
            Self::User(id) | Self::Task(id) => Some(*id),
        }
    }

    /// A template's prefix pins the owner scope it may be used with.
    pub fn accepts_template(&self, template: &str) -> bool {
        match self {
            Self::Platform => template.starts_with("platform_"),
            Self::User(_) => template.starts_with("user_"),
            Self::Task(_) => template.starts_with("task_"),
        }
    }

    /// Deterministic account id for this owner/template pair.
    pub fn account_id(&self, template: &str) -> Uuid {
        ids::account_uuid(&self.key(), template)
    }
}

/// Double-entry account classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Expense,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Liability => "liability",
            Self::Equity => "equity",
            Self::Expense => "expense",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "asset" => Ok(Self::Asset),
            "liability" => Ok(Self::Liability),
            "equity" => Ok(Self::Equity),
            "expense" => Ok(Self::Expense),
            other => Err(CoreError::Storage(format!("unknown account type {other}"))),
        }
    }

    /// Whether a debit increases the stored balance of this account class.
    pub fn debit_is_increase(&self) -> bool {
        matches!(self, Self::Asset | Self::Expense)
    }

    /// Account class for a well-known template.
    pub fn for_template(template: &str) -> CoreResult<Self> {
        match template {
            templates::PLATFORM_CASH => Ok(Self::Asset),
            templates::PLATFORM_REVENUE => Ok(Self::Equity),
            templates::TASK_ESCROW | templates::USER_RECEIVABLE => Ok(Self::Liability),
            other => Err(CoreError::validation(
                "invalid_template",
                format!("unknown account template {other}"),
            )),
        }
    }
}

/// Entry direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryDirection {
    Debit,
    Credit,
}

impl EntryDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            other => Err(CoreError::Storage(format!("unknown direction {other}"))),
        }
    }
}

/// Ledger transaction status machine.
///
/// `pending -> executing -> committed -> confirmed`, with
/// `pending|executing -> failed`. Confirmed and failed are terminal; rows
/// are never deletable (the constitution enforces both).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Executing,
    Committed,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "committed" => Ok(Self::Committed),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::Storage(format!("unknown tx status {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Executing)
                | (Self::Pending, Self::Failed)
                | (Self::Executing, Self::Committed)
                | (Self::Executing, Self::Failed)
                | (Self::Committed, Self::Confirmed)
        )
    }
}

/// One ledger account row.
#[derive(Debug, Clone)]
pub struct LedgerAccount {
    pub id: Uuid,
    pub owner_type: String,
    pub owner_id: Option<Uuid>,
    pub account_type: AccountType,
    pub currency: String,
    pub balance_cents: i64,
    pub baseline_balance: i64,
    pub baseline_ulid: Option<String>,
}

/// One ledger transaction row.
#[derive(Debug, Clone)]
pub struct LedgerTransaction {
    pub id: String,
    pub tx_type: String,
    pub status: TxStatus,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// One ledger entry row.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub tx_id: String,
    pub account_id: Uuid,
    pub direction: EntryDirection,
    pub amount_cents: i64,
}

/// Caller-provided entry for a prepared transaction.
#[derive(Debug, Clone)]
pub struct EntryInput {
    pub account_id: Uuid,
    pub direction: EntryDirection,
    pub amount_cents: i64,
}

/// Caller-provided input for `prepare_transaction`.
#[derive(Debug, Clone)]
pub struct TransactionInput {
    pub tx_type: String,
    pub idempotency_key: String,
    pub currency: String,
    pub metadata: serde_json::Value,
    pub entries: Vec<EntryInput>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_template_scoping() {
        let user = AccountOwner::User(Uuid::nil());
        assert!(user.accepts_template(templates::USER_RECEIVABLE));
        assert!(!user.accepts_template(templates::PLATFORM_CASH));
        assert!(AccountOwner::Platform.accepts_template(templates::PLATFORM_REVENUE));
        assert!(!AccountOwner::Platform.accepts_template(templates::TASK_ESCROW));
    }

    #[test]
    fn account_id_stable_per_owner() {
        let task = Uuid::new_v4();
        let a = AccountOwner::Task(task).account_id(templates::TASK_ESCROW);
        let b = AccountOwner::Task(task).account_id(templates::TASK_ESCROW);
        assert_eq!(a, b);
        assert_ne!(
            a,
            AccountOwner::Task(Uuid::new_v4()).account_id(templates::TASK_ESCROW)
        );
    }

    #[test]
    fn status_machine_edges() {
        use TxStatus::*;
        assert!(Pending.can_transition_to(Executing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Executing.can_transition_to(Committed));
        assert!(Executing.can_transition_to(Failed));
        assert!(Committed.can_transition_to(Confirmed));

        assert!(!Pending.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Failed));
        assert!(!Confirmed.can_transition_to(Pending));
        assert!(Confirmed.is_terminal());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn debit_direction_by_class() {
        assert!(AccountType::Asset.debit_is_increase());
        assert!(AccountType::Expense.debit_is_increase());
        assert!(!AccountType::Liability.debit_is_increase());
        assert!(!AccountType::Equity.debit_is_increase());
    }
}
