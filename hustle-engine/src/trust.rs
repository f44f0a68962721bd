//! Trust tiers
//!
//! Four tiers (1 Verified, 2 Trusted, 3 Proven, 4 Elite) gated on completed
//! task count, dispute rate, and rating. Upgrades are attempted after every
//! completion; downgrades carry a severity and a 30-day cooldown with a
//! floor at tier 1. Every change is one append-only `trust_ledger` row with
//! a deterministic idempotency key.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use hustle_core::{ids, CoreError, CoreResult};
use hustle_ledger::PgTx;

pub const TIER_NAMES: [&str; 4] = ["Verified", "Trusted", "Proven", "Elite"];
pub const DOWNGRADE_COOLDOWN_DAYS: i64 = 30;

/// The stats a tier decision reads.
#[derive(Debug, Clone, Default)]
pub struct UserStats {
    pub completed_tasks: i32,
    pub disputes_lost: i32,
    pub avg_rating: Option<f64>,
    pub sla_breach_open: bool,
}

/// Lost disputes over completions; zero completions means zero rate.
pub fn dispute_rate(stats: &UserStats) -> f64 {
    if stats.completed_tasks == 0 {
        return 0.0;
    }
    stats.disputes_lost as f64 / stats.completed_tasks as f64
}

/// Highest tier the stats support. Thresholds: tier 2 at 10 completions,
/// <= 5% disputes, 4.0 rating; tier 3 at 50 / 3% / 4.5; tier 4 at
/// 150 / 1% / 4.8.
pub fn eligible_tier(stats: &UserStats) -> i16 {
    let rate = dispute_rate(stats);
    let rating = stats.avg_rating.unwrap_or(0.0);

    if stats.completed_tasks >= 150 && rate <= 0.01 && rating >= 4.8 {
        4
    } else if stats.completed_tasks >= 50 && rate <= 0.03 && rating >= 4.5 {
        3
    } else if stats.completed_tasks >= 10 && rate <= 0.05 && rating >= 4.0 {
        2
    } else {
        1
    }
}

/// Downgrades are suppressed within the cooldown window of the previous one.
pub fn downgrade_allowed(last_downgrade_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_downgrade_at {
        None => true,
        Some(last) => now - last >= Duration::days(DOWNGRADE_COOLDOWN_DAYS),
    }
}

/// Append-only tier change recorder.
#[derive(Debug, Clone, Default)]
pub struct TrustService;

impl TrustService {
    pub fn new() -> Self {
        Self
    }

    /// Attempt an upgrade after a completion. No-op when the user already
    /// sits at (or above) the supported tier, or an SLA breach is open.
    pub async fn evaluate_upgrade(
        &self,
        tx: &mut PgTx<'_>,
        user_id: Uuid,
        task_id: Uuid,
    ) -> CoreResult<Option<i16>> {
        let (current, stats) = self.load_user(tx, user_id).await?;
        if stats.sla_breach_open {
            info!(%user_id, "upgrade skipped: open SLA breach");
            return Ok(None);
        }

        let target = eligible_tier(&stats);
        if target <= current {
            return Ok(None);
        }

        self.record_change(
            tx,
            user_id,
            current,
            target,
            "milestone_upgrade",
            "system",
            Some(task_id),
        )
        .await?;
        Ok(Some(target))
    }

    /// Record a downgrade of `severity` tiers, honoring the cooldown.
    /// Returns `None` when the change was suppressed or already at floor.
    pub async fn record_downgrade(
        &self,
        tx: &mut PgTx<'_>,
        user_id: Uuid,
        severity: i16,
        reason: &str,
        triggered_by: &str,
        task_id: Option<Uuid>,
    ) -> CoreResult<Option<i16>> {
        let (current, _) = self.load_user(tx, user_id).await?;
        let new_tier = (current - severity.max(1)).max(1);
        if new_tier == current {
            return Ok(None);
        }

        let last_downgrade: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(created_at) FROM trust_ledger
            WHERE user_id = $1 AND new_tier < old_tier
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        if !downgrade_allowed(last_downgrade, Utc::now()) {
            info!(
                %user_id, current, attempted = new_tier, reason,
                "downgrade suppressed by cooldown"
            );
            return Ok(None);
        }

        self.record_change(tx, user_id, current, new_tier, reason, triggered_by, task_id)
            .await?;
        Ok(Some(new_tier))
    }

    async fn load_user(&self, tx: &mut PgTx<'_>, user_id: Uuid) -> CoreResult<(i16, UserStats)> {
        let row = sqlx::query(
            r#"
            SELECT trust_tier, completed_tasks, disputes_lost, avg_rating, sla_breach_open
            FROM users
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| CoreError::not_found("user", user_id.to_string()))?;

        let tier: i16 = row.try_get("trust_tier").map_err(CoreError::from)?;
        let stats = UserStats {
            completed_tasks: row.try_get("completed_tasks").map_err(CoreError::from)?,
            disputes_lost: row.try_get("disputes_lost").map_err(CoreError::from)?,
            avg_rating: row.try_get("avg_rating").map_err(CoreError::from)?,
            sla_breach_open: row.try_get("sla_breach_open").map_err(CoreError::from)?,
        };
        Ok((tier, stats))
    }

    async fn record_change(
        &self,
        tx: &mut PgTx<'_>,
        user_id: Uuid,
        old_tier: i16,
        new_tier: i16,
        reason: &str,
        triggered_by: &str,
        task_id: Option<Uuid>,
    ) -> CoreResult<()> {
        let reason_ref = task_id
            .map(|t| format!("task:{t}"))
            .unwrap_or_else(|| reason.to_string());
        let key = ids::trust_key(&user_id, old_tier, new_tier, &reason_ref);

        let inserted = sqlx::query(
            r#"
            INSERT INTO trust_ledger
                (user_id, old_tier, new_tier, reason, triggered_by, task_id, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(old_tier)
        .bind(new_tier)
        .bind(reason)
        .bind(triggered_by)
        .bind(task_id)
        .bind(&key)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Same change already recorded; the tier column already moved.
            return Ok(());
        }

        sqlx::query("UPDATE users SET trust_tier = $2 WHERE id = $1")
            .bind(user_id)
            .bind(new_tier)
            .execute(&mut **tx)
            .await?;

        // Reaching the top tier mints its badge once.
        if new_tier == 4 && old_tier < 4 {
            sqlx::query(
                r#"
                INSERT INTO badge_ledger (user_id, badge, idempotency_key)
                VALUES ($1, 'elite', $2)
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(user_id)
            .bind(format!("badge:elite:{user_id}"))
            .execute(&mut **tx)
            .await?;
        }

        info!(%user_id, old_tier, new_tier, reason, "trust tier changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(completed: i32, lost: i32, rating: f64) -> UserStats {
        UserStats {
            completed_tasks: completed,
            disputes_lost: lost,
            avg_rating: Some(rating),
            sla_breach_open: false,
        }
    }

    #[test]
    fn tier_thresholds() {
        assert_eq!(eligible_tier(&stats(0, 0, 5.0)), 1);
        assert_eq!(eligible_tier(&stats(10, 0, 4.0)), 2);
        assert_eq!(eligible_tier(&stats(50, 1, 4.6)), 3);
        assert_eq!(eligible_tier(&stats(200, 1, 4.9)), 4);

        // One bad metric caps the tier.
        assert_eq!(eligible_tier(&stats(200, 20, 4.9)), 1);
        assert_eq!(eligible_tier(&stats(200, 1, 4.2)), 2);
    }

    #[test]
    fn unrated_users_stay_at_tier_one() {
        let s = UserStats {
            completed_tasks: 100,
            disputes_lost: 0,
            avg_rating: None,
            sla_breach_open: false,
        };
        assert_eq!(eligible_tier(&s), 1);
    }

    #[test]
    fn dispute_rate_handles_zero_completions() {
        assert_eq!(dispute_rate(&stats(0, 5, 4.0)), 0.0);
        assert!((dispute_rate(&stats(100, 5, 4.0)) - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn cooldown_window() {
        let now = Utc::now();
        assert!(downgrade_allowed(None, now));
        // Day 0 downgrade happened; day 15 is suppressed, day 31 allowed.
        let day0 = now - Duration::days(15);
        assert!(!downgrade_allowed(Some(day0), now));
        let day0 = now - Duration::days(31);
        assert!(downgrade_allowed(Some(day0), now));
        let exactly = now - Duration::days(DOWNGRADE_COOLDOWN_DAYS);
        assert!(downgrade_allowed(Some(exactly), now));
    }
}
