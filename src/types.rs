//! Core entities of the links prediction market.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identifier aliases; all ids are short prefixed strings (`usr_…`, `cyc_…`).
pub type UserId = String;
pub type CycleId = String;
pub type CandidateId = String;

/// Whether an account belongs to a person or a configured model agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Human,
    Ai,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Human => "HUMAN",
            AccountType::Ai => "AI",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "HUMAN" => Ok(AccountType::Human),
            "AI" => Ok(AccountType::Ai),
            other => Err(anyhow!("unknown account type: {other}")),
        }
    }
}

/// Cycle lifecycle; the transition OPEN -> SETTLED is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Open,
    Settled,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Open => "OPEN",
            CycleStatus::Settled => "SETTLED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "OPEN" => Ok(CycleStatus::Open),
            "SETTLED" => Ok(CycleStatus::Settled),
            other => Err(anyhow!("unknown cycle status: {other}")),
        }
    }
}

/// A market participant. `current_chips` is a cached projection of the chip
/// ledger; only ledger writes may move it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub account_type: AccountType,
    pub current_chips: i64,
    pub created_at: String,
    /// Watermark for the daily faucet; accrual advances it to the credit date.
    pub last_daily_credit_date: NaiveDate,
}

/// One dated round of submission, picking and settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub id: CycleId,
    pub cycle_date: NaiveDate,
    pub status: CycleStatus,
    pub opened_at: String,
    pub closed_at: Option<String>,
}

/// A link submitted into a cycle, unique per (cycle, canonical URL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateLink {
    pub id: CandidateId,
    pub cycle_id: CycleId,
    pub submitted_by_user_id: UserId,
    pub original_url: String,
    pub canonical_url: String,
    pub domain: String,
    pub title: String,
    pub created_at: String,
}

/// One user's ranked vote for one candidate in one cycle. Rank 1 is the
/// strongest pick; a user holds at most ten picks per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pick {
    pub id: String,
    pub cycle_id: CycleId,
    pub user_id: UserId,
    pub candidate_id: CandidateId,
    pub rank: u8,
    pub picked_at: String,
}
