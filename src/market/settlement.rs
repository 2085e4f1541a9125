//! Rank-based reward scoring at cycle settlement.
//!
//! The reward table `reward(rank) = 22 - 2 * rank` is an externally visible
//! numeric contract and must not change. Losing picks cost nothing; the
//! asymmetry is deliberate.

use std::collections::{HashMap, HashSet};

use crate::market::types::{SettlementCredit, SettlementEntry};
use crate::types::Pick;

/// Chips rewarded for a correct pick at `rank`: 20 for rank 1 down to 2 for
/// rank 10.
pub fn rank_reward(rank: u8) -> i64 {
    if (1..=10).contains(&rank) {
        22 - 2 * rank as i64
    } else {
        0
    }
}

/// Score every pick in a cycle against the winner set.
///
/// Returns one pending ledger credit per user with at least one winning pick
/// (their rewards are summed into a single entry) and the full participant
/// ranking ordered by (reward, correct picks) descending with competition
/// ranks: ties share a rank, the next rank is skipped.
pub fn score_picks(
    picks: &[Pick],
    winners: &HashSet<String>,
) -> (Vec<SettlementCredit>, Vec<SettlementEntry>) {
    let mut rewards: HashMap<&str, i64> = HashMap::new();
    let mut hits: HashMap<&str, u32> = HashMap::new();
    let mut participants: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for pick in picks {
        if seen.insert(pick.user_id.as_str()) {
            participants.push(pick.user_id.as_str());
        }
        if winners.contains(pick.candidate_id.as_str()) {
            *rewards.entry(pick.user_id.as_str()).or_insert(0) += rank_reward(pick.rank);
            *hits.entry(pick.user_id.as_str()).or_insert(0) += 1;
        }
    }

    let credits: Vec<SettlementCredit> = participants
        .iter()
        .filter_map(|user_id| {
            let chips = rewards.get(user_id).copied().unwrap_or(0);
            if chips <= 0 {
                return None;
            }
            Some(SettlementCredit {
                user_id: user_id.to_string(),
                chips,
                correct_picks: hits.get(user_id).copied().unwrap_or(0),
            })
        })
        .collect();

    let mut ranking: Vec<SettlementEntry> = participants
        .iter()
        .map(|user_id| SettlementEntry {
            user_id: user_id.to_string(),
            correct_count: hits.get(user_id).copied().unwrap_or(0),
            reward_chips: rewards.get(user_id).copied().unwrap_or(0),
            rank: 0,
        })
        .collect();
    ranking.sort_by(|a, b| {
        (b.reward_chips, b.correct_count).cmp(&(a.reward_chips, a.correct_count))
    });

    let mut current_rank = 0u32;
    let mut previous_key: Option<(i64, u32)> = None;
    for (idx, entry) in ranking.iter_mut().enumerate() {
        let key = (entry.reward_chips, entry.correct_count);
        if previous_key != Some(key) {
            current_rank = idx as u32 + 1;
            previous_key = Some(key);
        }
        entry.rank = current_rank;
    }

    (credits, ranking)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pick(user: &str, candidate_id: &str, rank: u8) -> Pick {
        Pick {
            id: format!("pk_{user}_{rank}"),
            cycle_id: "cyc_test".to_string(),
            user_id: user.to_string(),
            candidate_id: candidate_id.to_string(),
            rank,
            picked_at: "2026-02-06T09:00:00Z".to_string(),
        }
    }

    #[test]
    fn reward_table_matches_contract() {
        let expected = [20, 18, 16, 14, 12, 10, 8, 6, 4, 2];
        for rank in 1..=10u8 {
            assert_eq!(rank_reward(rank), expected[rank as usize - 1]);
            assert_eq!(rank_reward(rank), 22 - 2 * rank as i64);
        }
    }

    #[test]
    fn winning_ranks_one_and_two_pay_thirty_eight() {
        // Picks [B, A, C]: B rank 1, A rank 2, C rank 3; A and B win.
        let picks = vec![pick("u1", "b", 1), pick("u1", "a", 2), pick("u1", "c", 3)];
        let winners: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let (credits, ranking) = score_picks(&picks, &winners);

        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].chips, 20 + 18);
        assert_eq!(credits[0].correct_picks, 2);
        assert_eq!(ranking[0].reward_chips, 38);
    }

    #[test]
    fn losing_picks_produce_no_credit() {
        let picks = vec![pick("u1", "a", 1), pick("u2", "b", 1)];
        let winners: HashSet<String> = ["b".to_string()].into_iter().collect();
        let (credits, ranking) = score_picks(&picks, &winners);

        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].user_id, "u2");
        // u1 still appears in the ranking, with zero chips.
        let u1 = ranking.iter().find(|e| e.user_id == "u1").unwrap();
        assert_eq!(u1.reward_chips, 0);
        assert_eq!(u1.correct_count, 0);
    }

    #[test]
    fn tied_participants_share_a_rank() {
        let picks = vec![
            pick("u1", "w", 1),
            pick("u2", "w", 1),
            pick("u3", "w", 5),
        ];
        let winners: HashSet<String> = ["w".to_string()].into_iter().collect();
        let (_, ranking) = score_picks(&picks, &winners);

        assert_eq!(ranking[0].rank, 1);
        assert_eq!(ranking[1].rank, 1);
        assert_eq!(ranking[2].rank, 3);
    }
}
