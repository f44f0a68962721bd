//! Ledger guard
//!
//! Pre-write checks applied to every transaction input before a single row
//! is inserted. The constitution re-checks zero-sum and cardinality at
//! commit, so a bug that bypasses this guard still cannot land unbalanced
//! entries.

use std::collections::HashSet;

use hustle_core::{money, CoreError, CoreResult};

use crate::models::{EntryDirection, TransactionInput};

/// Stateless validation over a [`TransactionInput`].
pub struct LedgerGuard;

impl LedgerGuard {
    /// Run every check; the first failure wins.
    pub fn validate(input: &TransactionInput) -> CoreResult<()> {
        Self::check_currency(input)?;
        Self::check_cardinality(input)?;
        Self::check_amounts(input)?;
        Self::check_zero_sum(input)?;
        Self::check_distinct_accounts(input)?;
        Ok(())
    }

    fn check_currency(input: &TransactionInput) -> CoreResult<()> {
        if input.currency != money::CURRENCY {
            return Err(CoreError::validation(
                "bad_currency",
                format!("only {} is supported, got {}", money::CURRENCY, input.currency),
            ));
        }
        Ok(())
    }

    fn check_cardinality(input: &TransactionInput) -> CoreResult<()> {
        let n = input.entries.len();
        if n < 2 || n % 2 != 0 {
            return Err(CoreError::invariant(
                "INV-4",
                format!("transaction needs an even entry count >= 2, got {n}"),
            ));
        }
        Ok(())
    }

    fn check_amounts(input: &TransactionInput) -> CoreResult<()> {
        for entry in &input.entries {
            money::require_positive_cents(entry.amount_cents)?;
        }
        Ok(())
    }

    fn check_zero_sum(input: &TransactionInput) -> CoreResult<()> {
        let mut net: i64 = 0;
        for entry in &input.entries {
            let signed = match entry.direction {
                EntryDirection::Debit => entry.amount_cents,
                EntryDirection::Credit => -entry.amount_cents,
            };
            net = net.checked_add(signed).ok_or_else(|| {
                CoreError::invariant("INV-4", "entry sum overflows i64".to_string())
            })?;
        }
        if net != 0 {
            return Err(CoreError::invariant(
                "INV-4",
                format!("entries sum to {net} cents, need 0"),
            ));
        }
        Ok(())
    }

    // The same account may appear on both sides of a multi-leg transaction,
    // but a single (account, direction) pair must not repeat.
    fn check_distinct_accounts(input: &TransactionInput) -> CoreResult<()> {
        let mut seen = HashSet::new();
        for entry in &input.entries {
            if !seen.insert((entry.account_id, entry.direction)) {
                return Err(CoreError::validation(
                    "duplicate_entry",
                    format!(
                        "account {} appears twice as {}",
                        entry.account_id,
                        entry.direction.as_str()
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryInput;
    use uuid::Uuid;

    fn input(entries: Vec<EntryInput>) -> TransactionInput {
        TransactionInput {
            tx_type: "RELEASE_PAYOUT".into(),
            idempotency_key: "k".into(),
            currency: "USD".into(),
            metadata: serde_json::json!({}),
            entries,
        }
    }

    fn entry(account: Uuid, direction: EntryDirection, cents: i64) -> EntryInput {
        EntryInput {
            account_id: account,
            direction,
            amount_cents: cents,
        }
    }

    #[test]
    fn accepts_balanced_pair() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ok = input(vec![
            entry(a, EntryDirection::Debit, 2500),
            entry(b, EntryDirection::Credit, 2500),
        ]);
        assert!(LedgerGuard::validate(&ok).is_ok());
    }

    #[test]
    fn rejects_one_cent_imbalance() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let bad = input(vec![
            entry(a, EntryDirection::Debit, 2500),
            entry(b, EntryDirection::Credit, 2499),
        ]);
        let err = LedgerGuard::validate(&bad).unwrap_err();
        assert_eq!(err.code(), "INV-4");
    }

    #[test]
    fn rejects_odd_or_single_entry() {
        let a = Uuid::new_v4();
        let single = input(vec![entry(a, EntryDirection::Debit, 100)]);
        assert_eq!(LedgerGuard::validate(&single).unwrap_err().code(), "INV-4");

        let odd = input(vec![
            entry(a, EntryDirection::Debit, 100),
            entry(Uuid::new_v4(), EntryDirection::Credit, 50),
            entry(Uuid::new_v4(), EntryDirection::Credit, 50),
        ]);
        // Odd count fails before zero-sum is even considered.
        assert_eq!(LedgerGuard::validate(&odd).unwrap_err().code(), "INV-4");
    }

    #[test]
    fn rejects_nonpositive_amounts() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let zero = input(vec![
            entry(a, EntryDirection::Debit, 0),
            entry(b, EntryDirection::Credit, 0),
        ]);
        assert_eq!(LedgerGuard::validate(&zero).unwrap_err().code(), "bad_amount");
    }

    #[test]
    fn rejects_foreign_currency() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut eur = input(vec![
            entry(a, EntryDirection::Debit, 100),
            entry(b, EntryDirection::Credit, 100),
        ]);
        eur.currency = "EUR".into();
        assert_eq!(LedgerGuard::validate(&eur).unwrap_err().code(), "bad_currency");
    }

    #[test]
    fn rejects_repeated_account_direction() {
        let a = Uuid::new_v4();
        let dup = input(vec![
            entry(a, EntryDirection::Debit, 100),
            entry(a, EntryDirection::Debit, 100),
        ]);
        assert_eq!(
            LedgerGuard::validate(&dup).unwrap_err().code(),
            "duplicate_entry"
        );
    }
}
