//! Momentum and stability metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePair {
    pub momentum: i32,
    pub stability: i32,
}

impl ScorePair {
    /// Score of an entity with a single snapshot: no churn, fully stable.
    pub const BASELINE: ScorePair = ScorePair {
        momentum: 0,
        stability: 100,
    };
}

/// Momentum counts the changes in the current transition (not cumulative);
/// stability decays one point per day since the previous snapshot, floored
/// at zero.
pub fn compute_scores(change_count: usize, days_since_previous_change: i64) -> ScorePair {
    let momentum = i32::try_from(change_count)
        .unwrap_or(i32::MAX)
        .saturating_mul(2);
    let days = days_since_previous_change.clamp(0, 100);
    ScorePair {
        momentum,
        stability: (100 - days) as i32,
    }
}

/// Whole days elapsed between two instants. Never negative.
pub fn days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_days().max(0)
}
