//! Payment provider client
//!
//! Thin form-encoded client over the provider's REST API with a per-call
//! 30 s deadline, mandatory `Idempotency-Key` headers on every mutating
//! call, and a consecutive-failure circuit breaker. A burst of provider
//! 5xx opens the circuit; after a cooldown a single half-open probe is let
//! through.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use hustle_core::{CoreError, CoreResult};

const PROVIDER: &str = "stripe";
const CALL_DEADLINE: Duration = Duration::from_secs(30);
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Generic provider object; only the fields the core reads.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeObject {
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub livemode: bool,
    #[serde(default)]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResult {
    #[serde(default)]
    data: Vec<StripeObject>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Consecutive-failure circuit breaker with half-open probing.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Allow the call, or fail fast while the circuit is open. Once the
    /// cooldown elapses one probe is admitted; its outcome decides whether
    /// the circuit closes or re-opens.
    pub fn check(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(open_until) = inner.open_until {
            if Instant::now() < open_until {
                return Err(CoreError::provider(
                    PROVIDER,
                    "circuit open after repeated provider failures",
                    true,
                ));
            }
            // Half-open: admit this probe, re-arm so concurrent callers wait.
            inner.open_until = Some(Instant::now() + BREAKER_COOLDOWN);
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        inner.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= BREAKER_THRESHOLD {
            inner.open_until = Some(Instant::now() + BREAKER_COOLDOWN);
        }
    }

    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .open_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

/// Provider API client.
#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    secret_key: String,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl StripeClient {
    pub fn new(secret_key: String) -> Self {
        Self::with_base_url(secret_key, "https://api.stripe.com".to_string())
    }

    /// Base URL override for stub servers in tests and staging.
    pub fn with_base_url(secret_key: String, base_url: String) -> Self {
        let http = Client::builder()
            .timeout(CALL_DEADLINE)
            .build()
            .unwrap_or_default();
        Self {
            http,
            secret_key,
            base_url,
            breaker: Arc::new(CircuitBreaker::default()),
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    /// Create the PaymentIntent backing a new task's escrow.
    pub async fn create_payment_intent(
        &self,
        amount_cents: i64,
        task_id: Uuid,
        idempotency_key: &str,
    ) -> CoreResult<StripeObject> {
        self.post_form(
            "/v1/payment_intents",
            &[
                ("amount", amount_cents.to_string()),
                ("currency", "usd".to_string()),
                ("metadata[task_id]", task_id.to_string()),
            ],
            Some(idempotency_key),
        )
        .await
    }

    pub async fn capture_payment_intent(
        &self,
        payment_intent_id: &str,
        idempotency_key: &str,
    ) -> CoreResult<StripeObject> {
        self.post_form(
            &format!("/v1/payment_intents/{payment_intent_id}/capture"),
            &[],
            Some(idempotency_key),
        )
        .await
    }

    pub async fn cancel_payment_intent(
        &self,
        payment_intent_id: &str,
        idempotency_key: &str,
    ) -> CoreResult<StripeObject> {
        self.post_form(
            &format!("/v1/payment_intents/{payment_intent_id}/cancel"),
            &[],
            Some(idempotency_key),
        )
        .await
    }

    /// Outbound payout to the worker's connected account. The ledger
    /// transaction ULID is both the provider idempotency key and searchable
    /// metadata for crash recovery.
    pub async fn create_transfer(
        &self,
        amount_cents: i64,
        destination: &str,
        task_id: Uuid,
        ledger_tx: &str,
    ) -> CoreResult<StripeObject> {
        self.post_form(
            "/v1/transfers",
            &[
                ("amount", amount_cents.to_string()),
                ("currency", "usd".to_string()),
                ("destination", destination.to_string()),
                ("metadata[task_id]", task_id.to_string()),
                ("metadata[ledger_tx]", ledger_tx.to_string()),
            ],
            Some(ledger_tx),
        )
        .await
    }

    pub async fn create_refund(
        &self,
        payment_intent_id: &str,
        task_id: Uuid,
        ledger_tx: &str,
    ) -> CoreResult<StripeObject> {
        self.post_form(
            "/v1/refunds",
            &[
                ("payment_intent", payment_intent_id.to_string()),
                ("metadata[task_id]", task_id.to_string()),
                ("metadata[ledger_tx]", ledger_tx.to_string()),
            ],
            Some(ledger_tx),
        )
        .await
    }

    pub async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> CoreResult<StripeObject> {
        self.get(&format!("/v1/payment_intents/{payment_intent_id}"), &[])
            .await
    }

    /// Recovery path: does the provider already know about this ledger tx?
    pub async fn find_transfer_by_ledger_tx(
        &self,
        ledger_tx: &str,
    ) -> CoreResult<Option<StripeObject>> {
        let query = format!("metadata['ledger_tx']:'{ledger_tx}'");
        let result: SearchResult = self
            .get_as("/v1/transfers/search", &[("query", query)])
            .await?;
        Ok(result.data.into_iter().next())
    }

    /// All refunds the provider has recorded against one intent.
    pub async fn refunds_for_intent(
        &self,
        payment_intent_id: &str,
    ) -> CoreResult<Vec<StripeObject>> {
        let result: SearchResult = self
            .get_as(
                "/v1/refunds",
                &[("payment_intent", payment_intent_id.to_string())],
            )
            .await?;
        Ok(result.data)
    }

    pub async fn find_refund_for_intent(
        &self,
        payment_intent_id: &str,
        ledger_tx: &str,
    ) -> CoreResult<Option<StripeObject>> {
        Ok(self
            .refunds_for_intent(payment_intent_id)
            .await?
            .into_iter()
            .find(|r| r.metadata.get("ledger_tx").map(String::as_str) == Some(ledger_tx)))
    }

    /// Provider-side transfers for one task, used by the admin backfill.
    pub async fn transfers_for_task(&self, task_id: Uuid) -> CoreResult<Vec<StripeObject>> {
        let query = format!("metadata['task_id']:'{task_id}'");
        let result: SearchResult = self
            .get_as("/v1/transfers/search", &[("query", query)])
            .await?;
        Ok(result.data)
    }

    async fn post_form(
        &self,
        path: &str,
        params: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> CoreResult<StripeObject> {
        self.breaker.check()?;

        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(params);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(err) => {
                self.breaker.record_failure();
                return Err(err.into());
            }
        };
        self.handle_response(response).await
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> CoreResult<StripeObject> {
        self.breaker.check()?;
        let response = match self
            .http
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .query(query)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                self.breaker.record_failure();
                return Err(err.into());
            }
        };
        self.handle_response(response).await
    }

    async fn get_as<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> CoreResult<T> {
        self.breaker.check()?;
        let response = match self
            .http
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .query(query)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                self.breaker.record_failure();
                return Err(err.into());
            }
        };

        let status = response.status();
        if status.is_server_error() {
            self.breaker.record_failure();
            return Err(CoreError::provider(
                PROVIDER,
                format!("provider returned {status}"),
                true,
            ));
        }
        self.breaker.record_success();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::provider(
                PROVIDER,
                extract_error_message(&body, status.as_u16()),
                false,
            ));
        }
        response.json::<T>().await.map_err(Into::into)
    }

    async fn handle_response(&self, response: reqwest::Response) -> CoreResult<StripeObject> {
        let status = response.status();
        if status.is_server_error() {
            self.breaker.record_failure();
            return Err(CoreError::provider(
                PROVIDER,
                format!("provider returned {status}"),
                true,
            ));
        }
        // A 4xx is a working provider saying no; it closes the circuit.
        self.breaker.record_success();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "provider rejected request");
            return Err(CoreError::provider(
                PROVIDER,
                extract_error_message(&body, status.as_u16()),
                false,
            ));
        }

        let object: StripeObject = response.json().await?;
        debug!(id = %object.id, object = %object.object, "provider call ok");
        Ok(object)
    }
}

fn extract_error_message(body: &str, status: u16) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| format!("provider returned {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::default();
        assert!(breaker.check().is_ok());

        for _ in 0..BREAKER_THRESHOLD {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        assert!(breaker.check().is_err());
    }

    #[test]
    fn breaker_closes_on_success() {
        let breaker = CircuitBreaker::default();
        for _ in 0..BREAKER_THRESHOLD {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn failures_below_threshold_keep_circuit_closed() {
        let breaker = CircuitBreaker::default();
        for _ in 0..(BREAKER_THRESHOLD - 1) {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());
    }

    #[test]
    fn error_message_extraction() {
        let body = r#"{"error": {"message": "No such payment_intent"}}"#;
        assert_eq!(extract_error_message(body, 404), "No such payment_intent");
        assert_eq!(extract_error_message("not json", 402), "provider returned 402");
    }
}
