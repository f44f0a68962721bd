//! Ledger service
//!
//! Every operation takes a caller-provided open transaction; the caller owns
//! isolation (SERIALIZABLE via `hustle_core::retry::run_serializable`) and
//! commit/rollback. Balances move only in `commit`; `prepare_transaction`
//! writes the transaction and its entries without touching any account.

use md5::Md5;
use sha2::Digest;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use ulid::Ulid;
use uuid::Uuid;

use hustle_core::{ids, CoreError, CoreResult};

use crate::{
    guard::LedgerGuard,
    models::{
        AccountOwner, AccountType, EntryDirection, LedgerAccount, LedgerEntry, LedgerTransaction,
        TransactionInput, TxStatus,
    },
    snapshot, PgTx,
};

/// Transactional double-entry bookkeeping over Postgres.
#[derive(Debug, Clone, Default)]
pub struct LedgerService;

impl LedgerService {
    pub fn new() -> Self {
        Self
    }

    /// Upsert the deterministic account for `owner`/`template` and lock it.
    ///
    /// The id is `uuid(sha256(owner_key ":" template))`, so concurrent
    /// callers converge on the same row; the trailing `FOR UPDATE` hands the
    /// caller an exclusive hold for the rest of its transaction.
    pub async fn get_or_create_account(
        &self,
        tx: &mut PgTx<'_>,
        owner: AccountOwner,
        template: &str,
    ) -> CoreResult<LedgerAccount> {
        if !owner.accepts_template(template) {
            return Err(CoreError::validation(
                "invalid_template",
                format!(
                    "template {template} is not valid for a {} owner",
                    owner.owner_type()
                ),
            ));
        }
        let account_type = AccountType::for_template(template)?;
        let id = owner.account_id(template);

        sqlx::query(
            r#"
            INSERT INTO ledger_accounts (id, owner_type, owner_id, account_type)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(owner.owner_type())
        .bind(owner.owner_id())
        .bind(account_type.as_str())
        .execute(&mut **tx)
        .await?;

        self.lock_account(tx, id).await
    }

    /// `SELECT ... FOR UPDATE` on one account row.
    pub async fn lock_account(&self, tx: &mut PgTx<'_>, id: Uuid) -> CoreResult<LedgerAccount> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_type, owner_id, account_type, currency,
                   balance_cents, baseline_balance, baseline_ulid
            FROM ledger_accounts
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| CoreError::not_found("ledger_account", id.to_string()))?;

        account_from_row(&row)
    }

    /// Allocate a ULID, validate the input, and write the transaction row
    /// (`status = pending`) plus all entries. Balances stay untouched.
    pub async fn prepare_transaction(
        &self,
        tx: &mut PgTx<'_>,
        input: TransactionInput,
    ) -> CoreResult<LedgerTransaction> {
        LedgerGuard::validate(&input)?;

        let ulid = ids::new_ulid().to_string();

        // Lock touched accounts in id order and reject time travel before
        // any row is written.
        let mut account_ids: Vec<Uuid> = input.entries.iter().map(|e| e.account_id).collect();
        account_ids.sort();
        account_ids.dedup();
        for account_id in &account_ids {
            let account = self.lock_account(tx, *account_id).await?;
            Self::validate_monotonicity(account.baseline_ulid.as_deref(), &ulid)?;
        }

        let row = sqlx::query(
            r#"
            INSERT INTO ledger_transactions (id, tx_type, status, idempotency_key, metadata)
            VALUES ($1, $2, 'pending', $3, $4)
            RETURNING created_at
            "#,
        )
        .bind(&ulid)
        .bind(&input.tx_type)
        .bind(&input.idempotency_key)
        .bind(&input.metadata)
        .fetch_one(&mut **tx)
        .await?;
        let created_at = row.try_get("created_at").map_err(CoreError::from)?;

        for entry in &input.entries {
            sqlx::query(
                r#"
                INSERT INTO ledger_entries (tx_id, account_id, direction, amount_cents)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&ulid)
            .bind(entry.account_id)
            .bind(entry.direction.as_str())
            .bind(entry.amount_cents)
            .execute(&mut **tx)
            .await?;
        }

        info!(tx_id = %ulid, tx_type = %input.tx_type, "ledger transaction prepared");

        Ok(LedgerTransaction {
            id: ulid,
            tx_type: input.tx_type,
            status: TxStatus::Pending,
            idempotency_key: input.idempotency_key,
            metadata: input.metadata,
            created_at,
            committed_at: None,
        })
    }

    /// `pending -> executing`.
    pub async fn set_executing(&self, tx: &mut PgTx<'_>, tx_id: &str) -> CoreResult<()> {
        self.move_status(tx, tx_id, TxStatus::Pending, TxStatus::Executing)
            .await
    }

    /// `executing -> committed`: apply balance deltas, advance baselines,
    /// append the global sequence row, refresh snapshots.
    pub async fn commit(
        &self,
        tx: &mut PgTx<'_>,
        tx_id: &str,
        extra_metadata: serde_json::Value,
    ) -> CoreResult<LedgerTransaction> {
        let current = self.load_transaction(tx, tx_id).await?;
        if current.status != TxStatus::Executing {
            return Err(CoreError::illegal_transition(
                "ledger_transaction",
                current.status.as_str().to_string(),
                TxStatus::Committed.as_str().to_string(),
                "commit requires an executing transaction".to_string(),
            ));
        }

        let entries = self.load_entries(tx, tx_id).await?;

        // Aggregate signed deltas per account; the same account may appear
        // in several entries.
        let mut touched: Vec<(Uuid, i64)> = Vec::new();
        for entry in &entries {
            let account = self.lock_account(tx, entry.account_id).await?;
            let increase = match entry.direction {
                EntryDirection::Debit => account.account_type.debit_is_increase(),
                EntryDirection::Credit => !account.account_type.debit_is_increase(),
            };
            let delta = if increase {
                entry.amount_cents
            } else {
                -entry.amount_cents
            };
            match touched.iter_mut().find(|(id, _)| *id == entry.account_id) {
                Some((_, acc)) => *acc += delta,
                None => touched.push((entry.account_id, delta)),
            }
        }

        for (account_id, delta) in &touched {
            sqlx::query(
                r#"
                UPDATE ledger_accounts
                SET balance_cents = balance_cents + $2,
                    baseline_ulid = $3,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(account_id)
            .bind(delta)
            .bind(tx_id)
            .execute(&mut **tx)
            .await?;
        }

        let row = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = 'committed',
                committed_at = NOW(),
                metadata = metadata || $2
            WHERE id = $1
            RETURNING tx_type, idempotency_key, metadata, created_at, committed_at
            "#,
        )
        .bind(tx_id)
        .bind(&extra_metadata)
        .fetch_one(&mut **tx)
        .await?;

        let committed = LedgerTransaction {
            id: tx_id.to_string(),
            tx_type: row.try_get("tx_type").map_err(CoreError::from)?,
            status: TxStatus::Committed,
            idempotency_key: row.try_get("idempotency_key").map_err(CoreError::from)?,
            metadata: row.try_get("metadata").map_err(CoreError::from)?,
            created_at: row.try_get("created_at").map_err(CoreError::from)?,
            committed_at: row.try_get("committed_at").map_err(CoreError::from)?,
        };

        let tx_hash = global_tx_hash(&committed);
        sqlx::query(
            r#"
            INSERT INTO ledger_sequence (tx_id, tx_hash)
            VALUES ($1, $2)
            "#,
        )
        .bind(tx_id)
        .bind(&tx_hash)
        .execute(&mut **tx)
        .await?;

        for (account_id, _) in &touched {
            let balance: i64 =
                sqlx::query_scalar("SELECT balance_cents FROM ledger_accounts WHERE id = $1")
                    .bind(account_id)
                    .fetch_one(&mut **tx)
                    .await?;
            snapshot::refresh(tx, *account_id, balance, tx_id).await?;
        }

        info!(tx_id, tx_hash = %tx_hash, "ledger transaction committed");
        Ok(committed)
    }

    /// `pending|executing -> failed`, terminal. The reason lands in metadata.
    pub async fn mark_failed(
        &self,
        tx: &mut PgTx<'_>,
        tx_id: &str,
        reason: &str,
    ) -> CoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = 'failed',
                metadata = metadata || jsonb_build_object('failure_reason', $2::text)
            WHERE id = $1 AND status IN ('pending', 'executing')
            "#,
        )
        .bind(tx_id)
        .bind(reason)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current = self.load_transaction(tx, tx_id).await?;
            return Err(CoreError::illegal_transition(
                "ledger_transaction",
                current.status.as_str().to_string(),
                TxStatus::Failed.as_str().to_string(),
                "only pending or executing transactions can fail".to_string(),
            ));
        }
        warn!(tx_id, reason, "ledger transaction marked failed");
        Ok(())
    }

    /// `committed -> confirmed`; called by the webhook reconciler once the
    /// provider's own record agrees.
    pub async fn confirm(&self, tx: &mut PgTx<'_>, tx_id: &str) -> CoreResult<()> {
        self.move_status(tx, tx_id, TxStatus::Committed, TxStatus::Confirmed)
            .await
    }

    /// Reject writes whose ULID does not strictly advance the account.
    pub fn validate_monotonicity(baseline_ulid: Option<&str>, new_ulid: &str) -> CoreResult<()> {
        let Some(baseline) = baseline_ulid else {
            return Ok(());
        };
        let baseline = Ulid::from_string(baseline)
            .map_err(|e| CoreError::Storage(format!("bad baseline ulid: {e}")))?;
        let incoming = Ulid::from_string(new_ulid)
            .map_err(|e| CoreError::Storage(format!("bad ulid: {e}")))?;
        if incoming <= baseline {
            return Err(CoreError::invariant(
                "INV-MONOTONIC",
                format!("ulid {incoming} does not advance past {baseline}"),
            ));
        }
        Ok(())
    }

    /// A replayed idempotency key must present the same request body.
    pub fn replay_match(
        existing: &LedgerTransaction,
        idempotency_key: &str,
        body_hash: &str,
    ) -> CoreResult<()> {
        debug_assert_eq!(existing.idempotency_key, idempotency_key);
        let stored = existing
            .metadata
            .get("body_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if stored != body_hash {
            return Err(CoreError::validation(
                "replay_mismatch",
                format!(
                    "idempotency key {idempotency_key} replayed with a different body"
                ),
            ));
        }
        Ok(())
    }

    pub async fn find_by_idempotency_key(
        &self,
        tx: &mut PgTx<'_>,
        key: &str,
    ) -> CoreResult<Option<LedgerTransaction>> {
        let row = sqlx::query(
            r#"
            SELECT id, tx_type, status, idempotency_key, metadata, created_at, committed_at
            FROM ledger_transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|r| transaction_from_row(&r)).transpose()
    }

    pub async fn load_transaction(
        &self,
        tx: &mut PgTx<'_>,
        tx_id: &str,
    ) -> CoreResult<LedgerTransaction> {
        let row = sqlx::query(
            r#"
            SELECT id, tx_type, status, idempotency_key, metadata, created_at, committed_at
            FROM ledger_transactions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(tx_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| CoreError::not_found("ledger_transaction", tx_id))?;

        transaction_from_row(&row)
    }

    pub async fn load_entries(
        &self,
        tx: &mut PgTx<'_>,
        tx_id: &str,
    ) -> CoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_id, account_id, direction, amount_cents
            FROM ledger_entries
            WHERE tx_id = $1
            ORDER BY id
            "#,
        )
        .bind(tx_id)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(LedgerEntry {
                    tx_id: row.try_get("tx_id").map_err(CoreError::from)?,
                    account_id: row.try_get("account_id").map_err(CoreError::from)?,
                    direction: EntryDirection::parse(
                        row.try_get::<String, _>("direction")
                            .map_err(CoreError::from)?
                            .as_str(),
                    )?,
                    amount_cents: row.try_get("amount_cents").map_err(CoreError::from)?,
                })
            })
            .collect()
    }

    /// Cross-check outside the triggers: asset balances minus everything
    /// else must net to zero across the whole ledger.
    pub async fn assert_no_ghost_money(&self, pool: &PgPool) -> CoreResult<()> {
        let net: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(CASE WHEN account_type = 'asset'
                                      THEN balance_cents ELSE -balance_cents END), 0)::BIGINT
            FROM ledger_accounts
            "#,
        )
        .fetch_one(pool)
        .await?;

        if net != 0 {
            return Err(CoreError::invariant(
                "INV-GHOST-MONEY",
                format!("ledger nets to {net} cents, expected 0"),
            ));
        }
        Ok(())
    }

    async fn move_status(
        &self,
        tx: &mut PgTx<'_>,
        tx_id: &str,
        from: TxStatus,
        to: TxStatus,
    ) -> CoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = $3
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(tx_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current = self.load_transaction(tx, tx_id).await?;
            return Err(CoreError::illegal_transition(
                "ledger_transaction",
                current.status.as_str().to_string(),
                to.as_str().to_string(),
                format!("expected {}", from.as_str()),
            ));
        }
        Ok(())
    }
}

/// Global-sequence row hash: `md5(id || created_at || type)`.
fn global_tx_hash(tx: &LedgerTransaction) -> String {
    let mut hasher = Md5::new();
    hasher.update(tx.id.as_bytes());
    hasher.update(tx.created_at.to_rfc3339().as_bytes());
    hasher.update(tx.tx_type.as_bytes());
    hex::encode(hasher.finalize())
}

fn account_from_row(row: &sqlx::postgres::PgRow) -> CoreResult<LedgerAccount> {
    Ok(LedgerAccount {
        id: row.try_get("id").map_err(CoreError::from)?,
        owner_type: row.try_get("owner_type").map_err(CoreError::from)?,
        owner_id: row.try_get("owner_id").map_err(CoreError::from)?,
        account_type: AccountType::parse(
            row.try_get::<String, _>("account_type")
                .map_err(CoreError::from)?
                .as_str(),
        )?,
        currency: row.try_get("currency").map_err(CoreError::from)?,
        balance_cents: row.try_get("balance_cents").map_err(CoreError::from)?,
        baseline_balance: row.try_get("baseline_balance").map_err(CoreError::from)?,
        baseline_ulid: row.try_get("baseline_ulid").map_err(CoreError::from)?,
    })
}

fn transaction_from_row(row: &sqlx::postgres::PgRow) -> CoreResult<LedgerTransaction> {
    Ok(LedgerTransaction {
        id: row.try_get("id").map_err(CoreError::from)?,
        tx_type: row.try_get("tx_type").map_err(CoreError::from)?,
        status: TxStatus::parse(
            row.try_get::<String, _>("status")
                .map_err(CoreError::from)?
                .as_str(),
        )?,
        idempotency_key: row.try_get("idempotency_key").map_err(CoreError::from)?,
        metadata: row.try_get("metadata").map_err(CoreError::from)?,
        created_at: row.try_get("created_at").map_err(CoreError::from)?,
        committed_at: row.try_get("committed_at").map_err(CoreError::from)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tx_with(metadata: serde_json::Value) -> LedgerTransaction {
        LedgerTransaction {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            tx_type: "RELEASE_PAYOUT".into(),
            status: TxStatus::Committed,
            idempotency_key: "RELEASE_PAYOUT:t:e".into(),
            metadata,
            created_at: Utc::now(),
            committed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn monotonicity_rejects_time_travel() {
        let older = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let newer = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

        assert!(LedgerService::validate_monotonicity(None, newer).is_ok());
        assert!(LedgerService::validate_monotonicity(Some(older), newer).is_ok());

        let err = LedgerService::validate_monotonicity(Some(newer), older).unwrap_err();
        assert_eq!(err.code(), "INV-MONOTONIC");

        // Equal is also a rejection: strictly greater only.
        let err = LedgerService::validate_monotonicity(Some(older), older).unwrap_err();
        assert_eq!(err.code(), "INV-MONOTONIC");
    }

    #[test]
    fn replay_requires_matching_body() {
        let tx = tx_with(serde_json::json!({ "body_hash": "abc123" }));
        assert!(LedgerService::replay_match(&tx, "RELEASE_PAYOUT:t:e", "abc123").is_ok());

        let err =
            LedgerService::replay_match(&tx, "RELEASE_PAYOUT:t:e", "different").unwrap_err();
        assert_eq!(err.code(), "replay_mismatch");
    }

    #[test]
    fn global_hash_covers_identity_fields() {
        let a = tx_with(serde_json::json!({}));
        let mut b = a.clone();
        assert_eq!(global_tx_hash(&a), global_tx_hash(&b));

        b.tx_type = "REFUND_ESCROW".into();
        assert_ne!(global_tx_hash(&a), global_tx_hash(&b));
    }
}
