//! Killswitch, SafeMode, and the admin denylist
//!
//! All three are single-source-of-truth rows in Postgres fronted by a
//! short-TTL in-process cache. Writes require an authenticated admin action
//! and are recorded in the admin action ledger by the caller.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use hustle_core::{CoreError, CoreResult};

const CACHE_TTL: Duration = Duration::from_secs(5);

/// Snapshot of the process-wide safety flags.
#[derive(Debug, Clone, Default)]
pub struct SafetyFlags {
    pub killswitch_active: bool,
    pub killswitch_reason: Option<String>,
    pub safe_mode_active: bool,
    pub safe_mode_class: Option<String>,
}

/// Cached reader / audited writer for the safety flag rows.
#[derive(Clone)]
pub struct SafetyControls {
    pool: PgPool,
    cache: Arc<RwLock<Option<(SafetyFlags, Instant)>>>,
}

impl SafetyControls {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Current flags, served from the cache within its TTL.
    pub async fn flags(&self) -> CoreResult<SafetyFlags> {
        if let Some((flags, at)) = self.cache.read().await.clone() {
            if at.elapsed() < CACHE_TTL {
                return Ok(flags);
            }
        }

        let killswitch = sqlx::query("SELECT active, reason FROM killswitch WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        let safe_mode =
            sqlx::query("SELECT active, correction_class FROM safe_mode WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;

        let flags = SafetyFlags {
            killswitch_active: killswitch.try_get("active").map_err(CoreError::from)?,
            killswitch_reason: killswitch.try_get("reason").map_err(CoreError::from)?,
            safe_mode_active: safe_mode.try_get("active").map_err(CoreError::from)?,
            safe_mode_class: safe_mode
                .try_get("correction_class")
                .map_err(CoreError::from)?,
        };

        *self.cache.write().await = Some((flags.clone(), Instant::now()));
        Ok(flags)
    }

    /// Fail fast when the killswitch forbids money movement.
    pub async fn require_money_allowed(&self) -> CoreResult<()> {
        let flags = self.flags().await?;
        if flags.killswitch_active {
            return Err(CoreError::validation(
                "killswitch_active",
                flags
                    .killswitch_reason
                    .unwrap_or_else(|| "money movement is disabled".to_string()),
            ));
        }
        Ok(())
    }

    pub async fn engage_killswitch(&self, reason: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE killswitch SET active = TRUE, reason = $1, activated_at = NOW() WHERE id = 1",
        )
        .bind(reason)
        .execute(&self.pool)
        .await?;
        self.invalidate().await;
        warn!(reason, "killswitch engaged");
        Ok(())
    }

    pub async fn disengage_killswitch(&self) -> CoreResult<()> {
        sqlx::query(
            "UPDATE killswitch SET active = FALSE, reason = NULL, activated_at = NULL WHERE id = 1",
        )
        .execute(&self.pool)
        .await?;
        self.invalidate().await;
        info!("killswitch disengaged");
        Ok(())
    }

    pub async fn enter_safe_mode(&self, reason: &str, correction_class: &str) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE safe_mode
            SET active = TRUE, reason = $1, correction_class = $2, activated_at = NOW()
            WHERE id = 1
            "#,
        )
        .bind(reason)
        .bind(correction_class)
        .execute(&self.pool)
        .await?;
        self.invalidate().await;
        warn!(reason, correction_class, "safe mode entered");
        Ok(())
    }

    pub async fn exit_safe_mode(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE safe_mode
            SET active = FALSE, reason = NULL, correction_class = NULL, activated_at = NULL
            WHERE id = 1
            "#,
        )
        .execute(&self.pool)
        .await?;
        self.invalidate().await;
        info!("safe mode exited");
        Ok(())
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}

/// Admin denylist: blocks admin-privileged operations regardless of JWT
/// validity. Emergency entries carry no expiry.
#[derive(Clone)]
pub struct Denylist {
    pool: PgPool,
    upstash: Option<(String, String)>,
    http: reqwest::Client,
}

impl Denylist {
    pub fn new(pool: PgPool, upstash_url: Option<String>, upstash_token: Option<String>) -> Self {
        let upstash = match (upstash_url, upstash_token) {
            (Some(url), Some(token)) => Some((url, token)),
            _ => None,
        };
        Self {
            pool,
            upstash,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Checked on every admin entry point. The database is authoritative;
    /// the optional Upstash mirror catches entries pushed out-of-band, and
    /// its unavailability is never a denial.
    pub async fn is_denied(&self, user_id: Uuid) -> CoreResult<bool> {
        let denied: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT TRUE FROM admin_denylist
            WHERE user_id = $1
              AND (emergency OR expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        if denied.unwrap_or(false) {
            return Ok(true);
        }

        if let Some((url, token)) = &self.upstash {
            let endpoint = format!("{url}/get/denylist:{user_id}");
            if let Ok(resp) = self
                .http
                .get(&endpoint)
                .bearer_auth(token)
                .send()
                .await
            {
                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    if !body.get("result").map(|v| v.is_null()).unwrap_or(true) {
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    pub async fn deny(&self, user_id: Uuid, reason: &str, emergency: bool) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_denylist (user_id, reason, emergency)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET reason = $2, emergency = $3
            "#,
        )
        .bind(user_id)
        .bind(reason)
        .bind(emergency)
        .execute(&self.pool)
        .await?;
        warn!(%user_id, reason, emergency, "user denylisted");
        Ok(())
    }

    pub async fn allow(&self, user_id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM admin_denylist WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        info!(%user_id, "user removed from denylist");
        Ok(())
    }
}
