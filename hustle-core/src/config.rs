//! Environment-driven configuration
//!
//! All recognized options come from the process environment (a local `.env`
//! is honored first). Missing required values are a startup failure: the
//! binary reports them and exits 1 before touching the database.

use serde::Deserialize;

use crate::{CoreError, CoreResult};

/// Payment provider mode; `live` enables the strict livemode webhook check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StripeMode {
    Test,
    Live,
}

/// Top-level configuration for every binary in the workspace
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    pub database_url: String,
    pub stripe_secret_key: String,
    #[serde(default)]
    pub stripe_webhook_secret: Option<String>,
    #[serde(default = "default_stripe_mode")]
    pub stripe_mode: StripeMode,
    /// Guards all outbound money movement; off by default.
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub upstash_redis_rest_url: Option<String>,
    #[serde(default)]
    pub upstash_redis_rest_token: Option<String>,
    #[serde(default)]
    pub pagerduty_routing_key: Option<String>,
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    #[serde(default = "default_recovery_stuck_timeout")]
    pub recovery_stuck_timeout_minutes: i64,
    #[serde(default = "default_negative_outcome_rate")]
    pub negative_outcome_rate_threshold: f64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_stripe_mode() -> StripeMode {
    StripeMode::Test
}

fn default_recovery_stuck_timeout() -> i64 {
    10
}

fn default_negative_outcome_rate() -> f64 {
    0.25
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8080
}

impl CoreConfig {
    /// Load configuration from the environment (and `.env` if present).
    pub fn from_env() -> CoreResult<Self> {
        dotenvy::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .map_err(|e| CoreError::validation("config", e.to_string()))?;

        let cfg: CoreConfig = cfg
            .try_deserialize()
            .map_err(|e| CoreError::validation("config", e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.database_url.trim().is_empty() {
            return Err(CoreError::validation("config", "DATABASE_URL must not be empty"));
        }
        if self.stripe_secret_key.trim().is_empty() {
            return Err(CoreError::validation(
                "config",
                "STRIPE_SECRET_KEY must not be empty",
            ));
        }
        if !(0.0..=1.0).contains(&self.negative_outcome_rate_threshold) {
            return Err(CoreError::validation(
                "config",
                "NEGATIVE_OUTCOME_RATE_THRESHOLD must be within [0, 1]",
            ));
        }
        Ok(())
    }

    /// Whether the process treats itself as production for livemode checks.
    pub fn is_production(&self) -> bool {
        self.stripe_mode == StripeMode::Live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> CoreConfig {
        CoreConfig {
            database_url: "postgres://localhost/hustle".into(),
            stripe_secret_key: "sk_test_123".into(),
            stripe_webhook_secret: None,
            stripe_mode: StripeMode::Test,
            payouts_enabled: false,
            upstash_redis_rest_url: None,
            upstash_redis_rest_token: None,
            pagerduty_routing_key: None,
            slack_webhook_url: None,
            recovery_stuck_timeout_minutes: 10,
            negative_outcome_rate_threshold: 0.25,
            log_level: "info".into(),
            port: 8080,
        }
    }

    #[test]
    fn validates_required_fields() {
        let mut cfg = base_config();
        assert!(cfg.validate().is_ok());

        cfg.stripe_secret_key = "".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = base_config();
        cfg.negative_outcome_rate_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn live_mode_is_production() {
        let mut cfg = base_config();
        assert!(!cfg.is_production());
        cfg.stripe_mode = StripeMode::Live;
        assert!(cfg.is_production());
    }
}
