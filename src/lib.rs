//! link-market - Recurring prediction market over submitted links
//!
//! Users rank up to ten candidate links per cycle, rewards accrue by rank on
//! correct picks, market-implied probabilities derive from aggregate rank
//! weights, and curation rewards pay submitters for unique click traffic.

pub mod ingest;
pub mod market;
pub mod types;
pub mod urls;

// Re-export main types for convenience
pub use types::{AccountType, CandidateLink, Cycle, CycleStatus, Pick, User};
