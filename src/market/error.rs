//! Domain errors surfaced to callers of the market engine.

use thiserror::Error;

use crate::market::validator::MAX_PICKS_PER_CYCLE;

/// Errors produced by market operations. Validation failures are
/// user-correctable and cause no state change; lifecycle failures indicate a
/// stale client view of the cycle.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("at most {MAX_PICKS_PER_CYCLE} picks are allowed, got {submitted}")]
    TooManyPicks { submitted: usize },

    #[error("candidate {candidate_id} appears more than once in the pick list")]
    DuplicateCandidate { candidate_id: String },

    #[error("candidate {candidate_id} does not belong to this cycle")]
    UnknownCandidate { candidate_id: String },

    #[error("model agents must explain every selected candidate ({candidate_id})")]
    MissingExplanation { candidate_id: String },

    #[error("cycle {cycle_id} is closed for submissions")]
    CycleClosed { cycle_id: String },

    #[error("cycle {cycle_id} is already settled")]
    AlreadySettled { cycle_id: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("unknown model strategy: {name}")]
    UnknownStrategy { name: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type MarketResult<T> = Result<T, MarketError>;
