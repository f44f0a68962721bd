//! Recovery sweeps
//!
//! Everything that un-sticks the system without human hands: orphaned
//! webhook claims, orphaned outbox claims, ledger transactions stranded
//! mid-saga, the DLQ drain, the stuck-entity scanner, the outcome analyzer
//! that trips SafeMode, and the daily cleanup.

use std::sync::Arc;

use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use hustle_core::{CoreError, CoreResult};
use hustle_ledger::LedgerService;

use crate::{
    alerting::AlertService,
    metrics::CoreMetrics,
    outbox::OutboxClient,
    safety::SafetyControls,
    saga::{PaymentSaga, SagaRequest},
};

/// Webhook claims older than this are considered orphaned.
const WEBHOOK_CLAIM_TIMEOUT_MINUTES: i64 = 10;
const OUTBOX_CLAIM_TIMEOUT_SECS: i64 = 300;
/// DLQ items past this many attempts wait for manual resolution.
const DLQ_TERMINAL_ATTEMPTS: i32 = 8;
/// Minimum samples before the outcome analyzer may trip SafeMode.
const OUTCOME_MIN_SAMPLES: i64 = 5;

/// Owns every scheduled sweep.
pub struct RecoveryService {
    pool: PgPool,
    saga: Arc<PaymentSaga>,
    ledger: LedgerService,
    outbox: OutboxClient,
    safety: SafetyControls,
    alerts: AlertService,
    metrics: Arc<CoreMetrics>,
    stuck_timeout_minutes: i64,
    negative_outcome_threshold: f64,
}

impl RecoveryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        saga: Arc<PaymentSaga>,
        ledger: LedgerService,
        outbox: OutboxClient,
        safety: SafetyControls,
        alerts: AlertService,
        metrics: Arc<CoreMetrics>,
        stuck_timeout_minutes: i64,
        negative_outcome_threshold: f64,
    ) -> Self {
        Self {
            pool,
            saga,
            ledger,
            outbox,
            safety,
            alerts,
            metrics,
            stuck_timeout_minutes,
            negative_outcome_threshold,
        }
    }

    /// Every minute: reclaim orphaned claims, resolve stranded sagas, drain
    /// the DLQ, and refresh the stuck-entity gauges.
    pub async fn minutely(&self) -> CoreResult<()> {
        self.reclaim_stuck_webhooks().await?;

        let reclaimed = self
            .outbox
            .reclaim_stuck(&self.pool, OUTBOX_CLAIM_TIMEOUT_SECS)
            .await?;
        if reclaimed > 0 {
            info!(reclaimed, "orphaned outbox claims reset");
        }

        self.saga.recover_stuck(self.stuck_timeout_minutes).await?;
        self.drain_dlq().await?;
        self.scan_stuck_entities().await?;

        if let Some(age) = self.outbox.oldest_unpublished_age(&self.pool).await? {
            self.metrics.outbox_oldest_age_seconds.observe(age);
        }

        // A burst of rejected transitions means a caller is fighting the
        // state machines.
        let conflicts: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conflict_log WHERE created_at > NOW() - INTERVAL '1 hour'",
        )
        .fetch_one(&self.pool)
        .await?;
        if conflicts > 3 {
            self.alerts
                .warning(
                    "illegal transition rate elevated",
                    json!({ "conflicts_last_hour": conflicts }),
                )
                .await;
        }
        Ok(())
    }

    /// Every 5 minutes: flag suspicious proofs from the last 10 minutes.
    pub async fn fraud_scan(&self) -> CoreResult<()> {
        let flagged: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM proofs
            WHERE submitted_at > NOW() - INTERVAL '10 minutes'
              AND state = 'submitted'
              AND forensics ? 'flags'
              AND jsonb_array_length(forensics->'flags') > 0
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        if flagged > 0 {
            self.alerts
                .warning("fraud scan flagged proofs", json!({ "count": flagged }))
                .await;
        }
        Ok(())
    }

    /// Every 30 minutes: outcome attribution and the ghost-money cross-check.
    pub async fn half_hourly(&self) -> CoreResult<()> {
        self.outcome_attribution().await?;

        if let Err(err) = self.ledger.assert_no_ghost_money(&self.pool).await {
            self.metrics.observe_error(&err);
            self.alerts
                .critical("ledger ghost-money check failed", json!({ "error": err.to_string() }))
                .await;
            return Err(err);
        }
        Ok(())
    }

    /// Daily: retention cleanup of caches and settled plumbing rows.
    pub async fn daily_cleanup(&self) -> CoreResult<()> {
        let expired_keys = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();

        let old_outbox = sqlx::query(
            "DELETE FROM outbox_events WHERE published_at IS NOT NULL AND published_at < NOW() - INTERVAL '30 days'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        let old_webhooks = sqlx::query(
            "DELETE FROM processed_webhooks WHERE result = 'ok' AND processed_at < NOW() - INTERVAL '30 days'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(expired_keys, old_outbox, old_webhooks, "daily cleanup done");
        Ok(())
    }

    /// Reset `processing` webhook claims whose worker died mid-flight so a
    /// provider redelivery (or the failed-claim retry path) can reprocess.
    async fn reclaim_stuck_webhooks(&self) -> CoreResult<()> {
        let reset = sqlx::query(
            r#"
            UPDATE processed_webhooks
            SET result = 'failed', error_message = 'claim orphaned; reset by recovery'
            WHERE result = 'processing'
              AND processed_at IS NULL
              AND claimed_at < NOW() - make_interval(mins => $1)
            "#,
        )
        .bind(WEBHOOK_CLAIM_TIMEOUT_MINUTES as f64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reset > 0 {
            warn!(reset, "orphaned webhook claims reset for retry");
        }
        Ok(())
    }

    /// Retry unresolved DLQ items that still have budget; items past the
    /// terminal threshold wait for the admin CLI.
    async fn drain_dlq(&self) -> CoreResult<()> {
        // While the killswitch is engaged every retry would just bounce
        // back into the queue; wait it out.
        if self.safety.flags().await?.killswitch_active {
            return Ok(());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, payload, attempts FROM dead_letter_queue
            WHERE resolved_at IS NULL AND attempts < $1
            ORDER BY first_failed_at
            LIMIT 10
            "#,
        )
        .bind(DLQ_TERMINAL_ATTEMPTS)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let id: i64 = row.try_get("id").map_err(CoreError::from)?;
            let payload: serde_json::Value = row.try_get("payload").map_err(CoreError::from)?;
            let attempts: i32 = row.try_get("attempts").map_err(CoreError::from)?;

            let Ok(mut request) = serde_json::from_value::<SagaRequest>(payload.clone()) else {
                // Not a saga request; park it for manual resolution.
                sqlx::query("UPDATE dead_letter_queue SET attempts = $2 WHERE id = $1")
                    .bind(id)
                    .bind(DLQ_TERMINAL_ATTEMPTS)
                    .execute(&self.pool)
                    .await?;
                continue;
            };

            // Each retry is a fresh money event under a derived id; the
            // state-machine guard rejects it cleanly if the world moved on.
            request.event_id = format!("{}-r{}", request.event_id, attempts + 1);

            match self.saga.execute(request).await {
                Ok(_) => {
                    sqlx::query("UPDATE dead_letter_queue SET resolved_at = NOW() WHERE id = $1")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                    info!(dlq_id = id, "DLQ item resolved by retry");
                }
                Err(CoreError::IllegalTransition { .. }) => {
                    // The world moved on; this item can never apply again.
                    sqlx::query("UPDATE dead_letter_queue SET resolved_at = NOW(), last_error = 'superseded' WHERE id = $1")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
                Err(err) => {
                    let next_attempts = attempts + 1;
                    sqlx::query(
                        "UPDATE dead_letter_queue SET attempts = $2, last_error = $3 WHERE id = $1",
                    )
                    .bind(id)
                    .bind(next_attempts)
                    .bind(err.to_string())
                    .execute(&self.pool)
                    .await?;
                    if next_attempts >= DLQ_TERMINAL_ATTEMPTS {
                        self.alerts
                            .critical(
                                "DLQ item exhausted retries; manual resolution required",
                                json!({ "dlq_id": id, "error": err.to_string() }),
                            )
                            .await;
                    }
                }
            }
        }

        let depth: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        self.metrics.dlq_depth.set(depth);
        Ok(())
    }

    /// Refresh the stuck-entity gauges and alert on money-state mismatches.
    async fn scan_stuck_entities(&self) -> CoreResult<()> {
        let stale_proofs: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE state = 'proof_submitted'
              AND updated_at < NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        self.metrics
            .stuck_entities
            .with_label_values(&["task_awaiting_decision"])
            .set(stale_proofs);

        let stuck_sagas: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM ledger_transactions
            WHERE status IN ('pending', 'executing')
              AND created_at < NOW() - make_interval(mins => $1)
            "#,
        )
        .bind(self.stuck_timeout_minutes as f64)
        .fetch_one(&self.pool)
        .await?;
        self.metrics
            .stuck_entities
            .with_label_values(&["ledger_in_flight"])
            .set(stuck_sagas);

        // A completed task whose escrow is not released is a broken
        // invariant chain; it should be impossible.
        let mismatches: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tasks t
            JOIN escrows e ON e.task_id = t.id
            WHERE t.state = 'completed' AND e.state <> 'released'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        if mismatches > 0 {
            self.metrics
                .invariant_violations
                .with_label_values(&["INV-2"])
                .inc();
            self.alerts
                .critical(
                    "completed tasks with unreleased escrows detected",
                    json!({ "count": mismatches }),
                )
                .await;
        }
        Ok(())
    }

    /// Correction outcome attribution: over the last 24 hours, the share of
    /// money corrections that ended negative (refunds) against releases.
    /// Above the threshold with enough samples, SafeMode engages.
    async fn outcome_attribution(&self) -> CoreResult<()> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE to_state = 'refunded') AS negative,
                COUNT(*) AS total
            FROM state_transition_log
            WHERE entity_type = 'escrow'
              AND to_state IN ('released', 'refunded')
              AND created_at > NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let negative: i64 = row.try_get("negative").map_err(CoreError::from)?;
        let total: i64 = row.try_get("total").map_err(CoreError::from)?;

        if total < OUTCOME_MIN_SAMPLES {
            return Ok(());
        }
        let rate = negative as f64 / total as f64;
        if rate > self.negative_outcome_threshold {
            let already = self.safety.flags().await?.safe_mode_active;
            if !already {
                self.safety
                    .enter_safe_mode(
                        &format!("negative outcome rate {rate:.2} over last 24h ({negative}/{total})"),
                        "money_corrections",
                    )
                    .await?;
                self.alerts
                    .critical(
                        "SafeMode engaged by outcome analyzer",
                        json!({ "rate": rate, "negative": negative, "total": total }),
                    )
                    .await;
            }
        }
        Ok(())
    }
}
