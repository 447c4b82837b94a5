//! Credit scoring over aggregated activity totals.

mod score;

pub use score::{
    score, score_to_tier, CreditScore, ScoreBreakdown, ScoringParams, Tier,
    DEFAULT_BLOCKS_PER_DAY, LIQUIDATED_SCORE,
};
