//! Account snapshots
//!
//! After every commit each touched account gets a refreshed snapshot row
//! whose hash binds the account id, the integer balance, and the last ULID
//! that moved it. Auditors recompute the hash and compare.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use hustle_core::CoreResult;

use crate::PgTx;

/// `sha256(account_id || balance_int_as_string || last_tx_ulid)`, hex.
pub fn snapshot_hash(account_id: &Uuid, balance_cents: i64, last_tx_ulid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.to_string().as_bytes());
    hasher.update(balance_cents.to_string().as_bytes());
    hasher.update(last_tx_ulid.as_bytes());
    hex::encode(hasher.finalize())
}

/// Upsert the snapshot row for one account.
pub async fn refresh(
    tx: &mut PgTx<'_>,
    account_id: Uuid,
    balance_cents: i64,
    last_tx_ulid: &str,
) -> CoreResult<()> {
    let hash = snapshot_hash(&account_id, balance_cents, last_tx_ulid);
    sqlx::query(
        r#"
        INSERT INTO ledger_snapshots (account_id, balance_cents, last_tx_ulid, snapshot_hash, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (account_id) DO UPDATE
        SET balance_cents = $2, last_tx_ulid = $3, snapshot_hash = $4, updated_at = NOW()
        "#,
    )
    .bind(account_id)
    .bind(balance_cents)
    .bind(last_tx_ulid)
    .bind(&hash)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_sensitive() {
        let account = Uuid::nil();
        let a = snapshot_hash(&account, 2500, "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        let b = snapshot_hash(&account, 2500, "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, snapshot_hash(&account, 2501, "01ARZ3NDEKTSV4RRFFQ69G5FAV"));
        assert_ne!(a, snapshot_hash(&account, 2500, "01ARZ3NDEKTSV4RRFFQ69G5FAW"));
    }
}
