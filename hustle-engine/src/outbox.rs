//! Durable outbox
//!
//! Every business commit writes its side-effect events into `outbox_events`
//! inside the same database transaction; workers claim rows with
//! `FOR UPDATE SKIP LOCKED`, publish, and record the result. Exhausted rows
//! spill into the dead-letter queue for manual resolution.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use hustle_core::{CoreError, CoreResult};
use hustle_ledger::PgTx;

/// Queues with dedicated consumers.
pub mod queues {
    pub const CRITICAL_PAYMENTS: &str = "critical_payments";
    pub const USER_NOTIFICATIONS: &str = "user_notifications";
    pub const FRAUD_DETECTION: &str = "fraud_detection";
}

/// Wire schema version stamped into every envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// Attempts after which a row spills to the DLQ.
pub const MAX_ATTEMPTS: i32 = 6;

/// Input for one outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEventInput {
    pub aggregate_type: &'static str,
    pub aggregate_id: Uuid,
    pub event_type: &'static str,
    pub payload: serde_json::Value,
    pub queue: &'static str,
    pub idempotency_key: String,
}

/// A claimed outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub queue_name: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// Transactional writer / worker-side claimer for the outbox.
#[derive(Debug, Clone, Default)]
pub struct OutboxClient;

impl OutboxClient {
    pub fn new() -> Self {
        Self
    }

    /// Write one event inside the caller's business transaction. The unique
    /// idempotency key makes authoring exactly-once; a repeat is a no-op.
    pub async fn enqueue(&self, tx: &mut PgTx<'_>, input: OutboxEventInput) -> CoreResult<()> {
        let envelope = json!({
            "event_type": input.event_type,
            "aggregate_type": input.aggregate_type,
            "aggregate_id": input.aggregate_id,
            "payload": input.payload,
            "occurred_at": Utc::now(),
            "schema_version": SCHEMA_VERSION,
        });

        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, aggregate_type, aggregate_id, event_type, payload, idempotency_key, queue_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.aggregate_type)
        .bind(input.aggregate_id)
        .bind(input.event_type)
        .bind(&envelope)
        .bind(&input.idempotency_key)
        .bind(input.queue)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Claim a batch from one queue. Rows already claimed within
    /// `claim_timeout_secs` are skipped; `SKIP LOCKED` keeps concurrent
    /// workers from colliding.
    pub async fn claim_batch(
        &self,
        pool: &PgPool,
        queue: &str,
        limit: i64,
        claim_timeout_secs: i64,
    ) -> CoreResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            UPDATE outbox_events
            SET claimed_at = NOW()
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE queue_name = $1
                  AND published_at IS NULL
                  AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $3))
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, aggregate_type, aggregate_id, event_type, payload,
                      queue_name, attempts, created_at
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(claim_timeout_secs as f64)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id").map_err(CoreError::from)?,
                    aggregate_type: row.try_get("aggregate_type").map_err(CoreError::from)?,
                    aggregate_id: row.try_get("aggregate_id").map_err(CoreError::from)?,
                    event_type: row.try_get("event_type").map_err(CoreError::from)?,
                    payload: row.try_get("payload").map_err(CoreError::from)?,
                    queue_name: row.try_get("queue_name").map_err(CoreError::from)?,
                    attempts: row.try_get("attempts").map_err(CoreError::from)?,
                    created_at: row.try_get("created_at").map_err(CoreError::from)?,
                })
            })
            .collect()
    }

    pub async fn mark_published(&self, pool: &PgPool, id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE outbox_events SET published_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Record a failed delivery: bump attempts, schedule the next try with
    /// capped exponential backoff, and spill to the DLQ at the ceiling.
    pub async fn mark_failed(&self, pool: &PgPool, event: &OutboxEvent, error: &str) -> CoreResult<()> {
        let attempts = event.attempts + 1;
        if attempts >= MAX_ATTEMPTS {
            let mut tx = pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO dead_letter_queue (queue, payload, last_error, attempts)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&event.queue_name)
            .bind(&event.payload)
            .bind(error)
            .bind(attempts)
            .execute(&mut *tx)
            .await?;
            // Consumed from the outbox's point of view; the DLQ owns it now.
            sqlx::query(
                "UPDATE outbox_events SET attempts = $2, published_at = NOW() WHERE id = $1",
            )
            .bind(event.id)
            .bind(attempts)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            warn!(event_id = %event.id, queue = %event.queue_name, error, "outbox event moved to DLQ");
            return Ok(());
        }

        let delay_secs = backoff_seconds(attempts);
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = $2,
                claimed_at = NULL,
                next_attempt_at = NOW() + make_interval(secs => $3)
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(attempts)
        .bind(delay_secs as f64)
        .execute(pool)
        .await?;
        info!(event_id = %event.id, attempts, delay_secs, "outbox event rescheduled");
        Ok(())
    }

    /// Reset claims orphaned by a dead worker so another worker can take
    /// them over.
    pub async fn reclaim_stuck(&self, pool: &PgPool, claim_timeout_secs: i64) -> CoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET claimed_at = NULL
            WHERE published_at IS NULL
              AND claimed_at IS NOT NULL
              AND claimed_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(claim_timeout_secs as f64)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Age in seconds of the oldest unpublished row, if any.
    pub async fn oldest_unpublished_age(&self, pool: &PgPool) -> CoreResult<Option<f64>> {
        let age: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::DOUBLE PRECISION
            FROM outbox_events
            WHERE published_at IS NULL
            "#,
        )
        .fetch_one(pool)
        .await?;
        Ok(age)
    }
}

/// `30 * 2^(attempts-1)` seconds, capped at one hour.
pub fn backoff_seconds(attempts: i32) -> i64 {
    let attempts = attempts.max(1) as u32;
    (30i64.saturating_mul(1i64 << (attempts - 1).min(12))).min(3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_seconds(1), 30);
        assert_eq!(backoff_seconds(2), 60);
        assert_eq!(backoff_seconds(3), 120);
        assert_eq!(backoff_seconds(8), 3600);
        assert_eq!(backoff_seconds(40), 3600);
    }

    #[test]
    fn backoff_handles_degenerate_attempts() {
        assert_eq!(backoff_seconds(0), 30);
        assert_eq!(backoff_seconds(-5), 30);
    }
}
