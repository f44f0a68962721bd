//! Alert fan-out
//!
//! Alerts are always logged before any delivery attempt, then fanned out to
//! the primary pager (PagerDuty Events v2) with a chat webhook as fallback.
//! Delivery failure never blocks or fails the caller.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{error, warn};

/// Alert severity; maps to pager severity strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Fan-out alert publisher.
#[derive(Debug, Clone)]
pub struct AlertService {
    http: Client,
    pagerduty_routing_key: Option<String>,
    slack_webhook_url: Option<String>,
}

impl AlertService {
    pub fn new(pagerduty_routing_key: Option<String>, slack_webhook_url: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            pagerduty_routing_key,
            slack_webhook_url,
        }
    }

    pub async fn critical(&self, summary: &str, context: serde_json::Value) {
        self.send(Severity::Critical, summary, context).await;
    }

    pub async fn warning(&self, summary: &str, context: serde_json::Value) {
        self.send(Severity::Warning, summary, context).await;
    }

    async fn send(&self, severity: Severity, summary: &str, context: serde_json::Value) {
        // The log line is the alert of record; delivery is best-effort.
        match severity {
            Severity::Critical => error!(summary, %context, "ALERT"),
            Severity::Warning => warn!(summary, %context, "ALERT"),
        }

        let paged = self.page(severity, summary, &context).await;
        if !paged {
            self.chat(severity, summary, &context).await;
        }
    }

    async fn page(&self, severity: Severity, summary: &str, context: &serde_json::Value) -> bool {
        let Some(routing_key) = &self.pagerduty_routing_key else {
            return false;
        };
        let payload = json!({
            "routing_key": routing_key,
            "event_action": "trigger",
            "payload": {
                "summary": summary,
                "source": "hustle-core",
                "severity": severity.as_str(),
                "custom_details": context,
            }
        });
        match self
            .http
            .post("https://events.pagerduty.com/v2/enqueue")
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "pager delivery rejected");
                false
            }
            Err(err) => {
                warn!(error = %err, "pager delivery failed");
                false
            }
        }
    }

    async fn chat(&self, severity: Severity, summary: &str, context: &serde_json::Value) {
        let Some(url) = &self.slack_webhook_url else {
            return;
        };
        let payload = json!({
            "text": format!("[{}] {summary}\n```{context}```", severity.as_str()),
        });
        if let Err(err) = self.http.post(url).json(&payload).send().await {
            warn!(error = %err, "chat delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_channels_never_error() {
        let alerts = AlertService::new(None, None);
        // Both calls must complete without panicking or propagating errors.
        alerts.critical("ledger imbalance", json!({"net": 1})).await;
        alerts.warning("dlq growing", json!({"depth": 12})).await;
    }
}
