//! Market engine: pick validation, probability aggregation, settlement,
//! curation rewards and faucet accrual over an injected storage contract.

pub mod agents;
pub mod config;
pub mod curation;
pub mod error;
pub mod faucet;
pub mod jobs;
pub mod probability;
pub mod service;
pub mod settlement;
pub mod storage;
pub mod types;
pub mod validator;

// Re-export the main surface
pub use agents::{DefaultRankingStrategy, ModelRunner, ModelRunReport, ModelStrategy};
pub use config::{load_model_configs, ModelAgentConfig};
pub use error::{MarketError, MarketResult};
pub use jobs::JobService;
pub use service::MarketService;
pub use storage::{MarketStore, SqliteStore};
pub use types::{
    ChipLedgerEntry, ClickOutcome, CurationOutcome, CurationReward, CurationStatus, EventType,
    ModelPrediction, ProbabilityRow, SettlementEntry, SettlementSummary,
};
