//! XP awards
//!
//! One XP row per released escrow, computed with fixed-point decimal math
//! (round-down at every step, never floating point):
//!
//! ```text
//! base_xp     = max(10, floor(price_dollars))
//! decay       = 1 / (1 + log10(1 + total_xp_before / 1000))   (4 dp)
//! streak_mult = {1.0, 1.1, 1.2, 1.3, 1.5} by streak band
//! final_xp    = floor(base_xp * decay * streak_mult)
//! ```
//!
//! The unique constraint on `xp_ledger.escrow_id` is the idempotency
//! primitive; the award is persisted inside the same database transaction
//! that releases the escrow.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use hustle_core::{money, CoreError, CoreResult};
use hustle_ledger::PgTx;

/// Cumulative XP needed for each level, 1-indexed.
pub const LEVEL_THRESHOLDS: [i64; 10] = [0, 100, 300, 700, 1500, 2700, 4500, 7000, 10500, 18500];

/// The computed pieces of one award.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XpBreakdown {
    pub base_xp: i64,
    pub decay_factor: Decimal,
    pub streak_mult: Decimal,
    pub final_xp: i64,
}

/// Level reached at a given cumulative XP.
pub fn level_for_xp(total_xp: i64) -> u32 {
    LEVEL_THRESHOLDS
        .iter()
        .rev()
        .position(|t| total_xp >= *t)
        .map(|from_end| (LEVEL_THRESHOLDS.len() - from_end) as u32)
        .unwrap_or(1)
}

/// Streak multiplier bands.
pub fn streak_multiplier(streak_days: i32) -> Decimal {
    match streak_days {
        i32::MIN..=2 => Decimal::ONE,
        3..=6 => Decimal::new(11, 1),
        7..=13 => Decimal::new(12, 1),
        14..=29 => Decimal::new(13, 1),
        _ => Decimal::new(15, 1),
    }
}

/// Decay over the XP held *before* this award, stored to 4 decimal places.
pub fn decay_factor(total_xp_before: i64) -> Decimal {
    let ratio = Decimal::from(total_xp_before) / Decimal::from(1000);
    let inner = Decimal::ONE + ratio;
    let log10 = inner.log10();
    (Decimal::ONE / (Decimal::ONE + log10))
        .round_dp_with_strategy(4, RoundingStrategy::ToZero)
}

/// Full award computation.
pub fn compute_award(price_cents: i64, total_xp_before: i64, streak_days: i32) -> XpBreakdown {
    let base_xp = money::whole_dollars(price_cents).max(10);
    let decay = decay_factor(total_xp_before);
    let streak = streak_multiplier(streak_days);

    let product = Decimal::from(base_xp) * decay * streak;
    let final_xp = product
        .round_dp_with_strategy(0, RoundingStrategy::ToZero)
        .to_i64()
        .unwrap_or(0);

    XpBreakdown {
        base_xp,
        decay_factor: decay,
        streak_mult: streak,
        final_xp,
    }
}

/// Persists XP awards; one row per escrow, forever.
#[derive(Debug, Clone, Default)]
pub struct XpService;

impl XpService {
    pub fn new() -> Self {
        Self
    }

    /// Award XP for a released escrow inside the release transaction.
    ///
    /// A second call for the same escrow trips the `INV-5` unique
    /// constraint and surfaces as an invariant violation.
    pub async fn award_for_escrow(
        &self,
        tx: &mut PgTx<'_>,
        user_id: Uuid,
        escrow_id: Uuid,
        price_cents: i64,
    ) -> CoreResult<XpBreakdown> {
        let user = sqlx::query("SELECT xp_total, streak_days FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| CoreError::not_found("user", user_id.to_string()))?;
        let total_before: i64 = user.try_get("xp_total").map_err(CoreError::from)?;
        let streak_days: i32 = user.try_get("streak_days").map_err(CoreError::from)?;

        let award = compute_award(price_cents, total_before, streak_days);

        sqlx::query(
            r#"
            INSERT INTO xp_ledger (user_id, escrow_id, base_xp, decay_factor, streak_mult, final_xp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user_id)
        .bind(escrow_id)
        .bind(award.base_xp)
        .bind(award.decay_factor)
        .bind(award.streak_mult)
        .bind(award.final_xp)
        .execute(&mut **tx)
        .await?;

        sqlx::query("UPDATE users SET xp_total = xp_total + $2 WHERE id = $1")
            .bind(user_id)
            .bind(award.final_xp)
            .execute(&mut **tx)
            .await?;

        info!(%user_id, %escrow_id, final_xp = award.final_xp, "xp awarded");
        Ok(award)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_user_gets_face_value() {
        // $25 task, no prior XP, no streak.
        let award = compute_award(2500, 0, 1);
        assert_eq!(award.base_xp, 25);
        assert_eq!(award.decay_factor, Decimal::ONE);
        assert_eq!(award.streak_mult, Decimal::ONE);
        assert_eq!(award.final_xp, 25);
    }

    #[test]
    fn base_xp_has_a_floor_of_ten() {
        assert_eq!(compute_award(500, 0, 0).base_xp, 10);
        assert_eq!(compute_award(999, 0, 0).base_xp, 10);
        assert_eq!(compute_award(1100, 0, 0).base_xp, 11);
    }

    #[test]
    fn decay_at_one_thousand_xp() {
        // log10(2) = 0.30102...; 1/1.30102... = 0.76862..., truncated to 4 dp.
        let decay = decay_factor(1000);
        assert_eq!(decay, Decimal::new(7686, 4));
    }

    #[test]
    fn decay_rounds_down_not_nearest() {
        for xp in [1000i64, 3000, 9000, 123_456] {
            let d = decay_factor(xp);
            assert!(d.scale() <= 4);
            assert!(d < Decimal::ONE);
            assert!(d > Decimal::ZERO);
        }
    }

    #[test]
    fn streak_bands() {
        assert_eq!(streak_multiplier(0), Decimal::ONE);
        assert_eq!(streak_multiplier(2), Decimal::ONE);
        assert_eq!(streak_multiplier(3), Decimal::new(11, 1));
        assert_eq!(streak_multiplier(6), Decimal::new(11, 1));
        assert_eq!(streak_multiplier(7), Decimal::new(12, 1));
        assert_eq!(streak_multiplier(13), Decimal::new(12, 1));
        assert_eq!(streak_multiplier(14), Decimal::new(13, 1));
        assert_eq!(streak_multiplier(29), Decimal::new(13, 1));
        assert_eq!(streak_multiplier(30), Decimal::new(15, 1));
        assert_eq!(streak_multiplier(365), Decimal::new(15, 1));
    }

    #[test]
    fn final_xp_floors_the_product() {
        // base 25, decay 0.7686, streak 1.1 -> 21.1365 -> 21.
        let award = compute_award(2500, 1000, 3);
        assert_eq!(award.base_xp, 25);
        assert_eq!(award.final_xp, 21);
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(299), 2);
        assert_eq!(level_for_xp(300), 3);
        assert_eq!(level_for_xp(18_500), 10);
        assert_eq!(level_for_xp(1_000_000), 10);
    }
}
