//! Ordering gate: webhook ingress
//!
//! Every inbound provider webhook runs the same guard pipeline, in order:
//! source (signature + livemode), replay (claim row), temporal (no time
//! travel against the ledger), settlement (`payout.*` is bank-side noise),
//! then saga dispatch. Only a signature failure returns 400 — the provider
//! must retry those; every later rejection is acknowledged with 200 so the
//! provider stops retrying, and our own sweeps own any retry.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{info, warn};
use ulid::Ulid;
use uuid::Uuid;

use hustle_core::{ids, CoreError, CoreResult};
use hustle_ledger::models::templates;
use hustle_ledger::AccountOwner;

use crate::{
    alerting::AlertService,
    metrics::CoreMetrics,
    saga::{PaymentSaga, SagaAction, SagaRequest},
};

/// Signature timestamp tolerance, matching the provider SDK default.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Parsed provider event; only the fields the gate reads.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub livemode: bool,
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    /// The task this event targets, if its metadata names one.
    pub fn task_id(&self) -> Option<Uuid> {
        self.data
            .object
            .get("metadata")
            .and_then(|m| m.get("task_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    fn object_id(&self) -> Option<&str> {
        self.data.object.get("id").and_then(|v| v.as_str())
    }
}

/// Gate verdict for the HTTP layer.
#[derive(Debug)]
pub enum GateOutcome {
    /// Signature/parse failure; the only 400 the gate produces.
    Rejected(String),
    /// Acknowledged; body echoes what happened.
    Acknowledged(serde_json::Value),
}

/// Webhook ingress pipeline.
#[derive(Clone)]
pub struct OrderingGate {
    pool: PgPool,
    saga: Arc<PaymentSaga>,
    alerts: AlertService,
    metrics: Arc<CoreMetrics>,
    webhook_secret: Option<String>,
    is_production: bool,
}

impl OrderingGate {
    pub fn new(
        pool: PgPool,
        saga: Arc<PaymentSaga>,
        alerts: AlertService,
        metrics: Arc<CoreMetrics>,
        webhook_secret: Option<String>,
        is_production: bool,
    ) -> Self {
        Self {
            pool,
            saga,
            alerts,
            metrics,
            webhook_secret,
            is_production,
        }
    }

    pub async fn ingest(&self, signature_header: Option<&str>, body: &[u8]) -> GateOutcome {
        // ── 1. Source guard ───────────────────────────────────────────────
        let event = match self.source_guard(signature_header, body) {
            Ok(event) => event,
            Err(reason) => {
                self.metrics.webhook_failures.inc();
                return GateOutcome::Rejected(reason);
            }
        };

        match self.run_guarded(&event, body).await {
            Ok(ack) => GateOutcome::Acknowledged(ack),
            Err(err) => {
                // Post-signature failures are acknowledged; the stored claim
                // row keeps them retryable by the maintenance sweep.
                self.metrics.webhook_failures.inc();
                warn!(event_id = %event.id, error = %err, "webhook processing failed");
                self.finalize(&event.id, "failed", Some(&err.to_string()))
                    .await
                    .ok();
                GateOutcome::Acknowledged(json!({
                    "received": true,
                    "status": "failed",
                    "error_code": err.code(),
                }))
            }
        }
    }

    fn source_guard(
        &self,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<StripeEvent, String> {
        match (&self.webhook_secret, signature_header) {
            (Some(secret), Some(header)) => {
                verify_signature(secret, header, body, Utc::now().timestamp())?
            }
            (Some(_), None) => return Err("missing signature header".to_string()),
            (None, _) if self.is_production => {
                return Err("webhook secret not configured".to_string())
            }
            (None, _) => warn!("webhook signature verification skipped (no secret configured)"),
        }

        let event: StripeEvent =
            serde_json::from_slice(body).map_err(|e| format!("malformed event: {e}"))?;

        if self.is_production != event.livemode {
            return Err(format!(
                "livemode mismatch: event livemode={} environment production={}",
                event.livemode, self.is_production
            ));
        }
        Ok(event)
    }

    async fn run_guarded(&self, event: &StripeEvent, body: &[u8]) -> CoreResult<serde_json::Value> {
        // ── 2. Replay guard ───────────────────────────────────────────────
        if let Some(prior) = self.claim(event, body).await? {
            self.metrics.webhook_replays.inc();
            return Ok(prior);
        }

        // ── 3. Temporal guard ─────────────────────────────────────────────
        if drives_ledger(&event.event_type) {
            if let Some(task_id) = event.task_id() {
                let baseline = self.task_escrow_baseline(task_id).await?;
                if !temporal_ok(baseline.as_deref(), event.created) {
                    info!(event_id = %event.id, %task_id, "temporal guard rejected out-of-order event");
                    return Err(CoreError::invariant(
                        "INV-MONOTONIC",
                        format!("event {} arrives behind the ledger for task {task_id}", event.id),
                    ));
                }
            }
        }

        // ── 4. Settlement guard ───────────────────────────────────────────
        if event.event_type.starts_with("payout.") {
            if event.event_type == "payout.failed" {
                self.alerts
                    .critical(
                        "provider payout failed",
                        json!({ "event_id": event.id, "object": event.object_id() }),
                    )
                    .await;
            }
            let ack = json!({ "received": true, "settlement_only": true });
            self.finalize(&event.id, "ok", None).await?;
            return Ok(ack);
        }

        // ── 5. Dispatch ───────────────────────────────────────────────────
        let ack = self.dispatch(event).await?;

        // ── 6. Finalize ───────────────────────────────────────────────────
        self.finalize(&event.id, "ok", None).await?;
        Ok(ack)
    }

    /// Insert the claim row; `Some(ack)` means this event was already
    /// handled (or is being handled) and carries the stored answer.
    async fn claim(&self, event: &StripeEvent, body: &[u8]) -> CoreResult<Option<serde_json::Value>> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_webhooks (event_id, source, body_hash, result)
            VALUES ($1, 'stripe', $2, 'processing')
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&event.id)
        .bind(ids::body_hash(body))
        .fetch_optional(&self.pool)
        .await?;
        if claimed.is_some() {
            return Ok(None);
        }

        let row = sqlx::query(
            "SELECT result, error_message FROM processed_webhooks WHERE event_id = $1",
        )
        .bind(&event.id)
        .fetch_one(&self.pool)
        .await?;
        let result: String = row.try_get("result").map_err(CoreError::from)?;

        match result.as_str() {
            // A failed claim is retried inline by taking it back over.
            "failed" => {
                let retaken = sqlx::query(
                    r#"
                    UPDATE processed_webhooks
                    SET result = 'processing', claimed_at = NOW(), error_message = NULL
                    WHERE event_id = $1 AND result = 'failed'
                    RETURNING event_id
                    "#,
                )
                .bind(&event.id)
                .fetch_optional(&self.pool)
                .await?;
                if retaken.is_some() {
                    Ok(None)
                } else {
                    Ok(Some(json!({ "received": true, "status": "processing" })))
                }
            }
            "processing" => Ok(Some(json!({ "received": true, "status": "processing" }))),
            _ => Ok(Some(json!({ "received": true, "replayed": true }))),
        }
    }

    async fn dispatch(&self, event: &StripeEvent) -> CoreResult<serde_json::Value> {
        let object_id = event.object_id().map(String::from);

        match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let task_id = require_task(event)?;
                let charge_id = event.data.object.get("latest_charge").and_then(|v| v.as_str());
                self.saga
                    .execute(SagaRequest {
                        task_id,
                        action: SagaAction::HoldEscrow,
                        payload: json!({
                            "payment_intent_id": object_id,
                            "charge_id": charge_id,
                        }),
                        event_id: event.id.clone(),
                        admin_override: None,
                    })
                    .await?;
                Ok(json!({ "received": true, "action": "HOLD_ESCROW" }))
            }
            "payment_intent.amount_capturable_updated" => {
                let task_id = require_task(event)?;
                self.saga
                    .execute(SagaRequest {
                        task_id,
                        action: SagaAction::Capture,
                        payload: json!({ "payment_intent_id": object_id }),
                        event_id: event.id.clone(),
                        admin_override: None,
                    })
                    .await?;
                Ok(json!({ "received": true, "action": "CAPTURE" }))
            }
            "payment_intent.payment_failed" => {
                self.alerts
                    .warning(
                        "payment intent failed",
                        json!({ "event_id": event.id, "task_id": event.task_id() }),
                    )
                    .await;
                Ok(json!({ "received": true, "noted": "payment_failed" }))
            }
            "charge.succeeded" | "charge.captured" => {
                if let Some(task_id) = event.task_id() {
                    // Attach the charge while the escrow is still mutable.
                    sqlx::query(
                        r#"
                        UPDATE escrows
                        SET stripe_charge_id = $2, updated_at = NOW()
                        WHERE task_id = $1 AND state IN ('pending', 'funded')
                        "#,
                    )
                    .bind(task_id)
                    .bind(&object_id)
                    .execute(&self.pool)
                    .await?;
                }
                Ok(json!({ "received": true }))
            }
            "transfer.created" => {
                let confirmed = self.confirm_outbound(object_id.as_deref()).await?;
                Ok(json!({ "received": true, "confirmed": confirmed }))
            }
            "charge.refunded" => {
                let confirmed = match event.task_id() {
                    Some(task_id) => self.confirm_refund_for_task(task_id).await?,
                    None => false,
                };
                Ok(json!({ "received": true, "confirmed": confirmed }))
            }
            other => {
                info!(event_type = other, event_id = %event.id, "webhook ignored");
                Ok(json!({ "received": true, "ignored": true }))
            }
        }
    }

    /// Reconciler: a `transfer.created` event confirms the committed ledger
    /// transaction whose ULID keyed the outbound call.
    async fn confirm_outbound(&self, stripe_id: Option<&str>) -> CoreResult<bool> {
        let Some(stripe_id) = stripe_id else {
            return Ok(false);
        };
        let ledger_tx: Option<String> = sqlx::query_scalar(
            "SELECT idempotency_key FROM stripe_outbound_log WHERE stripe_id = $1",
        )
        .bind(stripe_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(ledger_tx) = ledger_tx else {
            return Ok(false);
        };

        let updated = sqlx::query(
            "UPDATE ledger_transactions SET status = 'confirmed' WHERE id = $1 AND status = 'committed'",
        )
        .bind(&ledger_tx)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn confirm_refund_for_task(&self, task_id: Uuid) -> CoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = 'confirmed'
            WHERE status = 'committed'
              AND tx_type IN ('REFUND_ESCROW', 'DISPUTE_RESOLVE')
              AND metadata->>'task_id' = $1
            "#,
        )
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn task_escrow_baseline(&self, task_id: Uuid) -> CoreResult<Option<String>> {
        let account_id = AccountOwner::Task(task_id).account_id(templates::TASK_ESCROW);
        let baseline: Option<Option<String>> =
            sqlx::query_scalar("SELECT baseline_ulid FROM ledger_accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(baseline.flatten())
    }

    async fn finalize(
        &self,
        event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhooks
            SET result = $2, error_message = $3, processed_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn require_task(event: &StripeEvent) -> CoreResult<Uuid> {
    event.task_id().ok_or_else(|| {
        CoreError::validation("missing_task_id", "event metadata carries no task_id")
    })
}

/// Event types whose dispatch opens new ledger writes and therefore must
/// not arrive behind the ledger. `charge.*` siblings are created
/// provider-side at the same instant as their intent event and only attach
/// or confirm, so ordering them against our own commit time would reject
/// legitimate deliveries.
fn drives_ledger(event_type: &str) -> bool {
    event_type.starts_with("payment_intent.")
}

/// The event must not arrive behind the last committed ledger write for its
/// target. ULIDs are time-seeded, so comparing the baseline's embedded
/// timestamp against the event's creation time catches time travel.
fn temporal_ok(baseline_ulid: Option<&str>, event_created_secs: i64) -> bool {
    let Some(baseline) = baseline_ulid else {
        return true;
    };
    let Ok(baseline) = Ulid::from_string(baseline) else {
        return true;
    };
    let event_ms = (event_created_secs.max(0) as u64).saturating_mul(1000);
    // Allow the full second the event timestamp truncates away.
    baseline.timestamp_ms() <= event_ms + 999
}

/// Verify a `t=...,v1=...` signature header over `"{t}.{body}"`.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now_secs: i64,
) -> Result<(), String> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| "signature header missing timestamp".to_string())?;
    if signatures.is_empty() {
        return Err("signature header missing v1 signature".to_string());
    }
    if (now_secs - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err("signature timestamp outside tolerance".to_string());
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| "bad webhook secret".to_string())?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if signatures.iter().any(|sig| constant_time_eq(sig, &expected)) {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8], timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", body, 1_700_000_000);
        assert!(verify_signature("whsec_test", &header, body, 1_700_000_100).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", body, 1_700_000_000);
        assert!(
            verify_signature("whsec_test", &header, br#"{"id":"evt_2"}"#, 1_700_000_100).is_err()
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", body, 1_700_000_000);
        assert!(verify_signature("whsec_other", &header, body, 1_700_000_100).is_err());
    }

    #[test]
    fn stale_timestamp_fails() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", body, 1_700_000_000);
        let err = verify_signature("whsec_test", &header, body, 1_700_000_000 + 301).unwrap_err();
        assert!(err.contains("tolerance"));
    }

    #[test]
    fn malformed_headers_fail() {
        assert!(verify_signature("s", "v1=abc", b"x", 0).is_err());
        assert!(verify_signature("s", "t=123", b"x", 123).is_err());
        assert!(verify_signature("s", "", b"x", 0).is_err());
    }

    #[test]
    fn temporal_guard_comparison() {
        // No ledger history: anything goes.
        assert!(temporal_ok(None, 1_700_000_000));

        // Baseline minted at t; an event created in the same second or later
        // is fine, earlier is time travel.
        let t_ms: u64 = 1_700_000_000_000;
        let baseline = Ulid::from_parts(t_ms, 0).to_string();
        assert!(temporal_ok(Some(&baseline), 1_700_000_000));
        assert!(temporal_ok(Some(&baseline), 1_700_000_050));
        assert!(!temporal_ok(Some(&baseline), 1_699_999_998));
    }

    #[test]
    fn event_task_extraction() {
        let event: StripeEvent = serde_json::from_value(json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "livemode": false,
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "pi_123",
                "metadata": { "task_id": "00000000-0000-0000-0000-000000000001" }
            }}
        }))
        .unwrap();
        assert_eq!(
            event.task_id().unwrap().to_string(),
            "00000000-0000-0000-0000-000000000001"
        );
        assert_eq!(event.object_id(), Some("pi_123"));
    }

    #[test]
    fn ledger_driving_types() {
        assert!(drives_ledger("payment_intent.succeeded"));
        assert!(drives_ledger("payment_intent.amount_capturable_updated"));
        assert!(!drives_ledger("charge.refunded"));
        assert!(!drives_ledger("payout.paid"));
        assert!(!drives_ledger("transfer.created"));
    }
}
