//! Engine-facing types: ledger entries, settlement and curation outputs.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::types::{CandidateId, CycleId, UserId};

/// Source of a chip delta in the append-only ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    SignupBonus,
    DailyFaucet,
    PickReward,
    CurationReward,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SignupBonus => "signup_bonus",
            EventType::DailyFaucet => "daily_faucet",
            EventType::PickReward => "pick_reward",
            EventType::CurationReward => "curation_reward",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "signup_bonus" => Ok(EventType::SignupBonus),
            "daily_faucet" => Ok(EventType::DailyFaucet),
            "pick_reward" => Ok(EventType::PickReward),
            "curation_reward" => Ok(EventType::CurationReward),
            other => Err(anyhow!("unknown ledger event type: {other}")),
        }
    }
}

/// Immutable record of a chip delta. The ledger is the only writer of
/// balance-affecting state; a user's balance is the fold of their entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipLedgerEntry {
    pub id: String,
    pub user_id: UserId,
    pub cycle_id: Option<CycleId>,
    pub event_type: EventType,
    pub chips_delta: i64,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

/// A model agent's declared probability and explanation for a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub cycle_id: CycleId,
    pub model_user_id: UserId,
    pub candidate_id: CandidateId,
    pub probability: f64,
    pub explanation: String,
}

/// Market-implied probability for one candidate, recomputed on every query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbabilityRow {
    pub candidate_id: CandidateId,
    pub url: String,
    pub domain: String,
    pub rank_weight_score: i64,
    pub market_probability: f64,
}

/// One pending `pick_reward` ledger credit computed at settlement.
#[derive(Debug, Clone)]
pub struct SettlementCredit {
    pub user_id: UserId,
    pub chips: i64,
    pub correct_picks: u32,
}

/// One participant's line in the settlement ranking. Ties share a rank and
/// the following rank is skipped (competition ranking).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEntry {
    pub user_id: UserId,
    pub correct_count: u32,
    pub reward_chips: i64,
    pub rank: u32,
}

/// Result of settling a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSummary {
    pub cycle_id: CycleId,
    pub winner_candidate_ids: Vec<CandidateId>,
    pub winner_count: usize,
    pub ranking: Vec<SettlementEntry>,
}

/// Outcome of recording one click. Duplicates and self-clicks are harmless
/// no-ops, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
    Counted,
    Duplicate,
    SelfClick,
}

/// Unique-click attribution for one submitter within a cycle.
#[derive(Debug, Clone)]
pub struct SubmitterClicks {
    pub user_id: UserId,
    pub unique_clicks: i64,
    /// Earliest candidate submission by this user in the cycle; tie-break key.
    pub first_submitted_at: String,
}

/// One computed curation reward, written at most once per (cycle, user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationReward {
    pub cycle_id: CycleId,
    pub user_id: UserId,
    pub rank: u32,
    pub unique_clicks: i64,
    pub reward_chips: i64,
}

/// Why a curation-reward run did or did not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurationStatus {
    Applied,
    CycleNotSettled,
    WaitWindow,
    NoneOrAlreadyAwarded,
}

/// Result of a curation-reward run for one cycle.
#[derive(Debug, Clone)]
pub struct CurationOutcome {
    pub status: CurationStatus,
    pub rows: Vec<CurationReward>,
}

impl CurationOutcome {
    pub fn awarded(&self) -> bool {
        self.status == CurationStatus::Applied
    }
}
