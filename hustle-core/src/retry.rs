//! SERIALIZABLE transaction runner
//!
//! Money-path writes run under SERIALIZABLE isolation. Postgres aborts one
//! side of a conflicting pair with SQLSTATE 40001 (or 40P01 for deadlocks);
//! those are safe to retry wholesale because the closure re-reads everything
//! it touches inside the fresh transaction.

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

use crate::CoreResult;

/// Maximum attempts for one logical operation.
pub const MAX_ATTEMPTS: u32 = 5;

const BASE_DELAY_MS: u64 = 50;
const MAX_DELAY_MS: u64 = 2000;

/// Exponential backoff with full jitter: `rand(0 ..= min(cap, base * 2^n))`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(10));
    let cap = exp.min(MAX_DELAY_MS);
    let jittered = rand::thread_rng().gen_range(0..=cap);
    Duration::from_millis(jittered)
}

/// Run `op` inside a SERIALIZABLE transaction, retrying on concurrency
/// conflicts with jittered exponential backoff.
///
/// The closure receives the open transaction and must do all its reads and
/// writes through it; the runner commits on `Ok` and rolls back on `Err`.
pub async fn run_serializable<T, F>(pool: &PgPool, mut op: F) -> CoreResult<T>
where
    F: for<'t> FnMut(&'t mut Transaction<'static, Postgres>) -> BoxFuture<'t, CoreResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        match op(&mut tx).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => return Ok(value),
                Err(err) => {
                    let err = crate::CoreError::from(err);
                    if err.is_retriable() && attempt + 1 < MAX_ATTEMPTS {
                        attempt += 1;
                        let delay = backoff_delay(attempt);
                        warn!(attempt, ?delay, "serializable commit conflict, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err);
                }
            },
            Err(err) => {
                tx.rollback().await.ok();
                if err.is_retriable() && attempt + 1 < MAX_ATTEMPTS {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(attempt, ?delay, error = %err, "serializable conflict, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_cap() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= Duration::from_millis(MAX_DELAY_MS));
        }
    }

    #[test]
    fn backoff_grows_with_attempts() {
        // The upper bound doubles until the cap; sample many draws so the
        // probabilistic assertion is stable.
        let max_first: u128 = (0..200)
            .map(|_| backoff_delay(0).as_millis())
            .max()
            .unwrap();
        assert!(max_first <= BASE_DELAY_MS as u128);

        let max_late: u128 = (0..200)
            .map(|_| backoff_delay(5).as_millis())
            .max()
            .unwrap();
        assert!(max_late <= MAX_DELAY_MS as u128);
        assert!(max_late > BASE_DELAY_MS as u128);
    }
}
