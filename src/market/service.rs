//! Market service: cycle lifecycle orchestration.
//!
//! Composes the validator, probability aggregator, settlement engine,
//! curation calculator and faucet over a shared `MarketStore`. The service
//! itself is stateless; "the open cycle" is always a query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, instrument};

use crate::market::curation::{self, CurationGate};
use crate::market::error::{MarketError, MarketResult};
use crate::market::faucet;
use crate::market::probability;
use crate::market::settlement;
use crate::market::storage::MarketStore;
use crate::market::types::{
    ClickOutcome, CurationOutcome, CurationStatus, ProbabilityRow, SettlementSummary,
};
use crate::market::validator;
use crate::types::{CandidateLink, Cycle, CycleStatus, Pick, User};
use crate::urls::canonicalize_url;

#[derive(Clone)]
pub struct MarketService {
    store: Arc<dyn MarketStore>,
}

impl MarketService {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    /// Open a new cycle for the given date.
    pub async fn create_cycle(&self, cycle_date: NaiveDate) -> MarketResult<Cycle> {
        self.store.create_cycle(cycle_date).await
    }

    /// Latest OPEN cycle, if any.
    pub async fn open_cycle(&self) -> MarketResult<Option<Cycle>> {
        self.store.get_open_cycle().await
    }

    /// Submit a link into an OPEN cycle. Resubmitting a canonical URL that
    /// already competes in the cycle returns the existing candidate.
    pub async fn submit_candidate(
        &self,
        cycle_id: &str,
        user_id: &str,
        url: &str,
        title: &str,
    ) -> MarketResult<CandidateLink> {
        let cycle = self.store.get_cycle(cycle_id).await?;
        if cycle.status != CycleStatus::Open {
            return Err(MarketError::CycleClosed {
                cycle_id: cycle_id.to_string(),
            });
        }
        self.store
            .create_candidate(cycle_id, user_id, url, title)
            .await
    }

    /// Validate and store a user's ranked picks as a full overwrite of any
    /// prior set. `explanations` (candidate id -> text) is mandatory per
    /// selected candidate when the user is a model agent.
    #[instrument(skip(self, candidate_ids, explanations))]
    pub async fn submit_picks(
        &self,
        cycle_id: &str,
        user_id: &str,
        candidate_ids: &[String],
        explanations: Option<&HashMap<String, String>>,
    ) -> MarketResult<Vec<Pick>> {
        let cycle = self.store.get_cycle(cycle_id).await?;
        let user = self.store.get_user(user_id).await?;
        let cycle_candidates: HashSet<String> = self
            .store
            .list_candidates(cycle_id)
            .await?
            .into_iter()
            .map(|candidate| candidate.id)
            .collect();

        validator::validate_picks(&cycle, &user, candidate_ids, explanations, &cycle_candidates)?;

        let picks = self
            .store
            .replace_picks(cycle_id, user_id, candidate_ids)
            .await?;
        debug!(
            "Stored {} picks for user {} in cycle {}",
            picks.len(),
            user_id,
            cycle_id
        );
        Ok(picks)
    }

    /// Market-implied probabilities for every candidate in the cycle,
    /// recomputed from the live pick set.
    pub async fn market_probabilities(&self, cycle_id: &str) -> MarketResult<Vec<ProbabilityRow>> {
        let candidates = self.store.list_candidates(cycle_id).await?;
        let picks = self.store.list_picks(cycle_id).await?;
        Ok(probability::market_probabilities(&candidates, &picks))
    }

    /// Settle an OPEN cycle against the judged winner URLs. Winner URLs are
    /// canonicalized and matched to candidates; URLs naming no candidate are
    /// ignored. The whole settlement is atomic and a second attempt fails
    /// with `AlreadySettled` and no ledger effect.
    #[instrument(skip(self, winner_urls))]
    pub async fn settle_cycle(
        &self,
        cycle_id: &str,
        winner_urls: &[String],
    ) -> MarketResult<SettlementSummary> {
        let cycle = self.store.get_cycle(cycle_id).await?;
        if cycle.status == CycleStatus::Settled {
            return Err(MarketError::AlreadySettled {
                cycle_id: cycle_id.to_string(),
            });
        }

        let candidates = self.store.list_candidates(cycle_id).await?;
        let mut by_canonical: HashMap<&str, &CandidateLink> = HashMap::new();
        for candidate in &candidates {
            by_canonical.insert(candidate.canonical_url.as_str(), candidate);
        }

        let mut winner_ids: Vec<String> = Vec::new();
        let mut winner_set: HashSet<String> = HashSet::new();
        for url in winner_urls {
            let Ok(canonical) = canonicalize_url(url) else {
                continue;
            };
            if let Some(candidate) = by_canonical.get(canonical.as_str()) {
                if winner_set.insert(candidate.id.clone()) {
                    winner_ids.push(candidate.id.clone());
                }
            }
        }

        let picks = self.store.list_picks(cycle_id).await?;
        let (credits, ranking) = settlement::score_picks(&picks, &winner_set);

        let results: Vec<(String, bool)> = candidates
            .iter()
            .map(|candidate| (candidate.id.clone(), winner_set.contains(&candidate.id)))
            .collect();

        self.store
            .commit_settlement(cycle_id, &results, &credits)
            .await?;

        info!(
            "Cycle {} settled: {} winners, {} participants",
            cycle_id,
            winner_ids.len(),
            ranking.len()
        );
        Ok(SettlementSummary {
            cycle_id: cycle_id.to_string(),
            winner_count: winner_ids.len(),
            winner_candidate_ids: winner_ids,
            ranking,
        })
    }

    /// Compute and post curation rewards for a settled cycle. Runs at most
    /// once per cycle; a cycle settled less than `min_age_hours` ago is
    /// deferred unless `force` so late clicks still count.
    #[instrument(skip(self))]
    pub async fn apply_curation_rewards(
        &self,
        cycle_id: &str,
        min_age_hours: i64,
        force: bool,
    ) -> MarketResult<CurationOutcome> {
        let cycle = self.store.get_cycle(cycle_id).await?;
        match curation::curation_gate(&cycle, Utc::now(), min_age_hours, force)? {
            CurationGate::CycleNotSettled => {
                return Ok(CurationOutcome {
                    status: CurationStatus::CycleNotSettled,
                    rows: Vec::new(),
                })
            }
            CurationGate::WaitWindow => {
                return Ok(CurationOutcome {
                    status: CurationStatus::WaitWindow,
                    rows: Vec::new(),
                })
            }
            CurationGate::Eligible => {}
        }

        if self.store.has_curation_rewards(cycle_id).await? {
            return Ok(CurationOutcome {
                status: CurationStatus::NoneOrAlreadyAwarded,
                rows: Vec::new(),
            });
        }

        let totals = self.store.curation_click_totals(cycle_id).await?;
        let rows = curation::curation_reward_rows(cycle_id, &totals);
        if rows.is_empty() {
            return Ok(CurationOutcome {
                status: CurationStatus::NoneOrAlreadyAwarded,
                rows: Vec::new(),
            });
        }

        if !self.store.insert_curation_rewards(cycle_id, &rows).await? {
            return Ok(CurationOutcome {
                status: CurationStatus::NoneOrAlreadyAwarded,
                rows: Vec::new(),
            });
        }

        info!(
            "Curation rewards applied for cycle {}: {} submitters",
            cycle_id,
            rows.len()
        );
        Ok(CurationOutcome {
            status: CurationStatus::Applied,
            rows,
        })
    }

    /// Accrue the daily faucet for one user as of the given date. Returns
    /// the chips credited; zero when the watermark is already current.
    pub async fn run_faucet(&self, user_id: &str, as_of: NaiveDate) -> MarketResult<i64> {
        let user = self.store.get_user(user_id).await?;
        let (missed_days, chips) = faucet::chips_owed(user.last_daily_credit_date, as_of);
        if missed_days == 0 {
            return Ok(0);
        }
        let credited = self
            .store
            .faucet_credit(user_id, chips, missed_days, user.last_daily_credit_date, as_of)
            .await?;
        Ok(if credited { chips } else { 0 })
    }

    /// Accrue the daily faucet for every user. Returns credited amounts by
    /// user id; users already at the watermark are omitted.
    pub async fn apply_daily_faucet(
        &self,
        as_of: NaiveDate,
    ) -> MarketResult<HashMap<String, i64>> {
        let mut credited = HashMap::new();
        for user in self.store.list_users().await? {
            let chips = self.run_faucet(&user.id, as_of).await?;
            if chips > 0 {
                credited.insert(user.id, chips);
            }
        }
        Ok(credited)
    }

    /// Record one click on a candidate's link. Duplicate fingerprints and
    /// submitter self-clicks report a harmless outcome instead of erroring.
    pub async fn record_click(
        &self,
        candidate_id: &str,
        fingerprint_source: &str,
        clicked_by_user_id: Option<&str>,
    ) -> MarketResult<ClickOutcome> {
        self.store
            .record_click(candidate_id, fingerprint_source, clicked_by_user_id)
            .await
    }

    /// Convenience used by demos and jobs: look up a user by email or create
    /// a fresh human account.
    pub async fn get_or_create_user(
        &self,
        display_name: &str,
        email: &str,
        created_on: NaiveDate,
    ) -> MarketResult<User> {
        if let Some(existing) = self.store.get_user_by_email(email).await? {
            return Ok(existing);
        }
        self.store
            .create_user(display_name, email, crate::types::AccountType::Human, created_on)
            .await
    }
}
