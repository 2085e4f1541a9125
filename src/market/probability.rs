//! Market-implied probabilities from aggregate rank weights.
//!
//! A pure read-time projection: no state, recomputed on every query. The
//! weight function `w(rank) = 11 - rank` is an externally visible numeric
//! contract and must not change.

use std::collections::HashMap;

use crate::market::types::ProbabilityRow;
use crate::types::{CandidateLink, Pick};

/// Weight contributed by a pick at `rank`: 10 for rank 1 down to 1 for
/// rank 10. Out-of-range ranks (not producible through validation) count 1.
pub fn rank_weight(rank: u8) -> i64 {
    if (1..=10).contains(&rank) {
        11 - rank as i64
    } else {
        1
    }
}

/// Compute every candidate's market-implied probability from the picks
/// registered so far. With no picks the total weight is zero and every
/// probability is 0.0 rather than a division error.
///
/// Rows are sorted by probability descending; the sort is stable, so tied
/// candidates keep their submission order.
pub fn market_probabilities(candidates: &[CandidateLink], picks: &[Pick]) -> Vec<ProbabilityRow> {
    let mut weights: HashMap<&str, i64> = HashMap::new();
    for pick in picks {
        *weights.entry(pick.candidate_id.as_str()).or_insert(0) += rank_weight(pick.rank);
    }
    let total_weight: i64 = weights.values().sum();

    let mut rows: Vec<ProbabilityRow> = candidates
        .iter()
        .map(|candidate| {
            let score = weights.get(candidate.id.as_str()).copied().unwrap_or(0);
            let probability = if total_weight > 0 {
                score as f64 / total_weight as f64
            } else {
                0.0
            };
            ProbabilityRow {
                candidate_id: candidate.id.clone(),
                url: candidate.original_url.clone(),
                domain: candidate.domain.clone(),
                rank_weight_score: score,
                market_probability: probability,
            }
        })
        .collect();

    rows.sort_by(|a, b| b.market_probability.total_cmp(&a.market_probability));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str) -> CandidateLink {
        CandidateLink {
            id: id.to_string(),
            cycle_id: "cyc_test".to_string(),
            submitted_by_user_id: "usr_test".to_string(),
            original_url: format!("https://example.com/{id}"),
            canonical_url: format!("https://example.com/{id}"),
            domain: "example.com".to_string(),
            title: id.to_string(),
            created_at: "2026-02-06T08:00:00Z".to_string(),
        }
    }

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
    fn weight_table_matches_contract() {
        for rank in 1..=10u8 {
            assert_eq!(rank_weight(rank), 11 - rank as i64);
        }
        assert_eq!(rank_weight(1), 10);
        assert_eq!(rank_weight(10), 1);
    }

    #[test]
    fn no_picks_means_all_zero() {
        let candidates = vec![candidate("a"), candidate("b")];
        let rows = market_probabilities(&candidates, &[]);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.market_probability == 0.0));
    }

    #[test]
    fn probabilities_sum_to_one() {
        let candidates = vec![candidate("a"), candidate("b"), candidate("c")];
        let picks = vec![
            pick("u1", "a", 1),
            pick("u1", "b", 2),
            pick("u2", "a", 1),
            pick("u2", "c", 2),
        ];
        let rows = market_probabilities(&candidates, &picks);
        let total: f64 = rows.iter().map(|row| row.market_probability).sum();
        assert!((total - 1.0).abs() < 1e-9);

        // weights: a = 10 + 10 = 20, b = 9, c = 9, total = 38
        let by_id: HashMap<_, _> = rows
            .iter()
            .map(|row| (row.candidate_id.as_str(), row))
            .collect();
        assert!((by_id["a"].market_probability - 20.0 / 38.0).abs() < 1e-9);
        assert!((by_id["b"].market_probability - 9.0 / 38.0).abs() < 1e-9);
        assert_eq!(by_id["a"].rank_weight_score, 20);
    }

    #[test]
    fn single_candidate_takes_full_probability() {
        let candidates = vec![candidate("x")];
        let picks = vec![pick("u1", "x", 1), pick("u2", "x", 1), pick("u3", "x", 3)];
        let rows = market_probabilities(&candidates, &picks);
        assert_eq!(rows[0].rank_weight_score, 28);
        assert_eq!(rows[0].market_probability, 1.0);
    }
}
