//! Structural validation of a user's ranked pick list.
//!
//! Validation is pure; callers load the cycle and its candidates and pass
//! them in. A pick list that validates is written as a full overwrite of the
//! user's prior picks, re-ranked by list position.

use std::collections::{HashMap, HashSet};

use crate::market::error::{MarketError, MarketResult};
use crate::types::{AccountType, Cycle, CycleStatus, User};

/// Maximum ranked picks a user may hold in one cycle.
pub const MAX_PICKS_PER_CYCLE: usize = 10;

/// Validate an ordered candidate-id list for one user in one cycle.
///
/// `explanations` maps candidate id to explanation text; it is required to
/// cover every picked candidate when the acting user is a model agent, and
/// is ignored for humans.
pub fn validate_picks(
    cycle: &Cycle,
    user: &User,
    candidate_ids: &[String],
    explanations: Option<&HashMap<String, String>>,
    cycle_candidates: &HashSet<String>,
) -> MarketResult<()> {
    if cycle.status != CycleStatus::Open {
        return Err(MarketError::CycleClosed {
            cycle_id: cycle.id.clone(),
        });
    }

    if candidate_ids.len() > MAX_PICKS_PER_CYCLE {
        return Err(MarketError::TooManyPicks {
            submitted: candidate_ids.len(),
        });
    }

    let mut seen = HashSet::with_capacity(candidate_ids.len());
    for candidate_id in candidate_ids {
        if !seen.insert(candidate_id.as_str()) {
            return Err(MarketError::DuplicateCandidate {
                candidate_id: candidate_id.clone(),
            });
        }
        if !cycle_candidates.contains(candidate_id) {
            return Err(MarketError::UnknownCandidate {
                candidate_id: candidate_id.clone(),
            });
        }
    }

    if user.account_type == AccountType::Ai {
        for candidate_id in candidate_ids {
            let explained = explanations
                .and_then(|map| map.get(candidate_id))
                .map(|text| !text.trim().is_empty())
                .unwrap_or(false);
            if !explained {
                return Err(MarketError::MissingExplanation {
                    candidate_id: candidate_id.clone(),
                });
            }
        }
    }

    Ok(())
}
