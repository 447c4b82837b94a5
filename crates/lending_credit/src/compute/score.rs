//! Weighted credit score and tier from aggregated activity totals.
//!
//! All arithmetic is integer fixed-point in basis points so identical totals
//! always yield identical scores.

use crate::ledger::ActivityRecord;
use crate::types::U256;
use primitive_types::U512;
use serde::{Deserialize, Serialize};

/// 1.0 in basis points.
const BPS: u64 = 10_000;

pub const WEIGHT_REPAYMENT: u64 = 35;
pub const WEIGHT_UTILIZATION: u64 = 30;
pub const WEIGHT_CUSHION: u64 = 15;
pub const WEIGHT_HISTORY: u64 = 10;
pub const WEIGHT_RECENCY: u64 = 10;

/// Score assigned to any account with a recorded liquidation.
pub const LIQUIDATED_SCORE: u8 = 10;

/// ~12s blocks.
pub const DEFAULT_BLOCKS_PER_DAY: u64 = 7_200;
pub const HISTORY_CAP_DAYS: u64 = 365;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Poor,
    Fair,
    Good,
    Excellent,
}

pub fn score_to_tier(score: u8) -> Tier {
    match score {
        85.. => Tier::Excellent,
        70..=84 => Tier::Good,
        50..=69 => Tier::Fair,
        _ => Tier::Poor,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringParams {
    pub blocks_per_day: u64,
    /// Full recency weight up to this many days since the latest activity.
    pub recency_grace_days: u64,
    /// Recency weight reaches zero at this many days.
    pub recency_zero_days: u64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            blocks_per_day: DEFAULT_BLOCKS_PER_DAY,
            recency_grace_days: 90,
            recency_zero_days: 365,
        }
    }
}

/// Component contributions in basis points of a score point
/// (e.g. 332_500 = 33.25 points).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub repayment: u64,
    pub utilization: u64,
    pub cushion: u64,
    pub history: u64,
    pub recency: u64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u64 {
        self.repayment + self.utilization + self.cushion + self.history + self.recency
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditScore {
    pub score: u8,
    pub tier: Tier,
    /// `None` when a liquidation short-circuited the components.
    pub breakdown: Option<ScoreBreakdown>,
}

/// `num / den` in basis points, clamped to [0, 1]; `None` when `den == 0`.
fn ratio_bps(num: U512, den: U512) -> Option<u64> {
    if den.is_zero() {
        return None;
    }
    if num >= den {
        return Some(BPS);
    }
    Some((num * U512::from(BPS) / den).low_u64())
}

fn wide(v: U256) -> U512 {
    U512::from(v)
}

/// Fraction of `full` remaining as `elapsed` runs from `grace` to `zero`.
fn linear_decay_bps(elapsed: u64, grace: u64, zero: u64) -> u64 {
    if elapsed <= grace {
        return BPS;
    }
    if elapsed >= zero || zero <= grace {
        return 0;
    }
    let left = u128::from(zero - elapsed);
    let span = u128::from(zero - grace);
    (left * u128::from(BPS) / span) as u64
}

/// Score `totals` as of `current_block`. Pure and deterministic.
pub fn score(totals: &ActivityRecord, current_block: u64, params: &ScoringParams) -> CreditScore {
    if totals.liquidations > 0 {
        return CreditScore {
            score: LIQUIDATED_SCORE,
            tier: score_to_tier(LIQUIDATED_SCORE),
            breakdown: None,
        };
    }

    let borrowed = wide(totals.borrowed_amount);
    let supplied = wide(totals.supplied_amount);
    let repaid = wide(totals.repaid_amount);

    let repayment_bps = ratio_bps(repaid, borrowed).unwrap_or(BPS);
    let utilization_bps = ratio_bps(borrowed, borrowed + supplied).unwrap_or(0);
    let cushion_bps = ratio_bps(supplied, borrowed).unwrap_or(BPS);

    let bpd = params.blocks_per_day.max(1);
    let age_blocks = if totals.first_activity_block == 0 {
        0
    } else {
        current_block.saturating_sub(totals.first_activity_block)
    };
    let history_window = U512::from(HISTORY_CAP_DAYS) * U512::from(bpd);
    let history_bps = ratio_bps(U512::from(age_blocks), history_window).unwrap_or(0);

    let idle_blocks = current_block.saturating_sub(totals.latest_block);
    let recency_bps = linear_decay_bps(
        idle_blocks,
        params.recency_grace_days.saturating_mul(bpd),
        params.recency_zero_days.saturating_mul(bpd),
    );

    let breakdown = ScoreBreakdown {
        repayment: WEIGHT_REPAYMENT * repayment_bps,
        utilization: WEIGHT_UTILIZATION * (BPS - utilization_bps),
        cushion: WEIGHT_CUSHION * cushion_bps,
        history: WEIGHT_HISTORY * history_bps,
        recency: WEIGHT_RECENCY * recency_bps,
    };
    let rounded = ((breakdown.total() + BPS / 2) / BPS).min(100) as u8;
    CreditScore {
        score: rounded,
        tier: score_to_tier(rounded),
        breakdown: Some(breakdown),
    }
}
