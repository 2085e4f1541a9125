//! Curation rewards from unique click traffic.
//!
//! Submitters are ranked by the unique clicks their candidates drew; the top
//! three positions pay out of a fixed chip pool. A tie group spanning several
//! positions pools the chips of the eligible positions and splits them
//! evenly, so the curve stays monotonic non-increasing in rank.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};

use crate::market::types::{CurationReward, SubmitterClicks};
use crate::types::{Cycle, CycleStatus};

/// Chips paid per leaderboard position.
pub const CURATION_RANK_REWARDS: [(u32, i64); 3] = [(1, 40), (2, 20), (3, 10)];

fn reward_for_position(rank: u32) -> Option<i64> {
    CURATION_RANK_REWARDS
        .iter()
        .find(|(position, _)| *position == rank)
        .map(|(_, chips)| *chips)
}

fn max_rewarded_position() -> u32 {
    CURATION_RANK_REWARDS
        .iter()
        .map(|(position, _)| *position)
        .max()
        .unwrap_or(0)
}

/// Reasons a curation run is gated before any computation happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurationGate {
    Eligible,
    CycleNotSettled,
    WaitWindow,
}

/// Check whether a cycle is eligible for curation rewards: it must be
/// SETTLED, and unless `force` is set its closure must be at least
/// `min_age_hours` old so late clicks still count.
pub fn curation_gate(
    cycle: &Cycle,
    now: DateTime<Utc>,
    min_age_hours: i64,
    force: bool,
) -> Result<CurationGate> {
    if cycle.status != CycleStatus::Settled {
        return Ok(CurationGate::CycleNotSettled);
    }
    if force {
        return Ok(CurationGate::Eligible);
    }
    if let Some(closed_at) = &cycle.closed_at {
        let closed = DateTime::parse_from_rfc3339(closed_at)
            .map_err(|e| anyhow!("unparseable cycle closed_at {closed_at}: {e}"))?
            .with_timezone(&Utc);
        if now - closed < Duration::hours(min_age_hours) {
            return Ok(CurationGate::WaitWindow);
        }
    }
    Ok(CurationGate::Eligible)
}

/// Compute reward rows from per-submitter unique-click totals.
///
/// `totals` must already be ordered: unique clicks descending, then earliest
/// candidate submission ascending, then user id (the storage query emits
/// this order). Submitters with zero clicks are excluded upstream.
pub fn curation_reward_rows(cycle_id: &str, totals: &[SubmitterClicks]) -> Vec<CurationReward> {
    let max_position = max_rewarded_position();
    let mut rows = Vec::new();
    let mut idx = 0usize;
    let mut next_rank = 1u32;

    while idx < totals.len() && next_rank <= max_position {
        let click_count = totals[idx].unique_clicks;
        let group_start = idx;
        while idx < totals.len() && totals[idx].unique_clicks == click_count {
            idx += 1;
        }
        let tie_group = &totals[group_start..idx];

        let start_rank = next_rank;
        let end_rank = (start_rank + tie_group.len() as u32 - 1).min(max_position);
        let pool: i64 = (start_rank..=end_rank)
            .filter_map(reward_for_position)
            .sum();
        if pool == 0 {
            break;
        }

        let split = ((pool as f64) / (tie_group.len() as f64)).round() as i64;
        for member in tie_group {
            rows.push(CurationReward {
                cycle_id: cycle_id.to_string(),
                user_id: member.user_id.clone(),
                rank: start_rank,
                unique_clicks: member.unique_clicks,
                reward_chips: split,
            });
        }

        next_rank += tie_group.len() as u32;
    }

    rows
}
