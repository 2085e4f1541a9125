//! Idempotent background jobs.
//!
//! Every job claims a (job_name, run_key) row before doing work, so a rerun
//! within the same key window is a recorded no-op. `force` bypasses the
//! claim for operator-driven runs.

use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use tracing::info;

use crate::ingest::{FeedIngestor, SyncReport};
use crate::market::agents::{ModelRunner, ModelRunReport};
use crate::market::error::MarketResult;
use crate::market::service::MarketService;
use crate::market::storage::MarketStore;
use crate::market::types::CurationOutcome;
use crate::types::CycleStatus;

const JOB_DAILY_FAUCET: &str = "daily_faucet";
const JOB_MODEL_RUN: &str = "model_run";
const JOB_SYNC_LINKS: &str = "sync_assorted_links";
const JOB_CURATION_REWARDS: &str = "curation_rewards";

/// Outcome of a faucet job run.
#[derive(Debug)]
pub struct FaucetJobResult {
    pub skipped: bool,
    pub run_key: String,
    pub credited: HashMap<String, i64>,
}

/// Outcome of a model-agent job run.
#[derive(Debug)]
pub struct ModelJobResult {
    pub skipped: bool,
    pub run_key: Option<String>,
    pub cycle_id: Option<String>,
    pub reports: HashMap<String, ModelRunReport>,
}

/// Outcome of a feed-sync job run.
#[derive(Debug)]
pub struct SyncJobResult {
    pub skipped: bool,
    pub run_key: String,
    pub report: Option<SyncReport>,
}

/// Outcome of one cycle's curation job run.
#[derive(Debug)]
pub struct CurationJobResult {
    pub cycle_id: String,
    pub skipped: bool,
    pub outcome: Option<CurationOutcome>,
}

pub struct JobService {
    market: MarketService,
    runner: ModelRunner,
    ingestor: FeedIngestor,
}

impl JobService {
    pub fn new(market: MarketService, runner: ModelRunner, ingestor: FeedIngestor) -> Self {
        Self {
            market,
            runner,
            ingestor,
        }
    }

    pub fn runner_mut(&mut self) -> &mut ModelRunner {
        &mut self.runner
    }

    /// Credit the daily faucet for every user, at most once per date.
    pub async fn run_daily_faucet(
        &self,
        as_of: Option<NaiveDate>,
        force: bool,
    ) -> MarketResult<FaucetJobResult> {
        let run_date = as_of.unwrap_or_else(|| Utc::now().date_naive());
        let run_key = run_date.to_string();
        if !force
            && !self
                .market
                .store()
                .claim_job_run(
                    JOB_DAILY_FAUCET,
                    &run_key,
                    serde_json::json!({"as_of_date": run_key}),
                )
                .await?
        {
            return Ok(FaucetJobResult {
                skipped: true,
                run_key,
                credited: HashMap::new(),
            });
        }

        let credited = self.market.apply_daily_faucet(run_date).await?;
        info!(
            "Daily faucet {} credited {} users",
            run_key,
            credited.len()
        );
        Ok(FaucetJobResult {
            skipped: false,
            run_key,
            credited,
        })
    }

    /// Run every enabled model agent over the open (or given) cycle, at most
    /// once per cycle per hour.
    pub async fn run_models(
        &self,
        cycle_id: Option<&str>,
        force: bool,
    ) -> MarketResult<ModelJobResult> {
        let cycle = match cycle_id {
            Some(id) => Some(self.market.store().get_cycle(id).await?),
            None => self.market.open_cycle().await?,
        };
        let Some(cycle) = cycle else {
            return Ok(ModelJobResult {
                skipped: true,
                run_key: None,
                cycle_id: None,
                reports: HashMap::new(),
            });
        };

        let run_key = format!("{}:{}", cycle.id, Utc::now().format("%Y%m%d%H"));
        if !force
            && !self
                .market
                .store()
                .claim_job_run(
                    JOB_MODEL_RUN,
                    &run_key,
                    serde_json::json!({"cycle_id": cycle.id}),
                )
                .await?
        {
            return Ok(ModelJobResult {
                skipped: true,
                run_key: Some(run_key),
                cycle_id: Some(cycle.id),
                reports: HashMap::new(),
            });
        }

        let reports = self.runner.run_cycle(&cycle.id).await?;
        Ok(ModelJobResult {
            skipped: false,
            run_key: Some(run_key),
            cycle_id: Some(cycle.id),
            reports,
        })
    }

    /// Sync the assorted-links feed, at most once per hour.
    pub async fn sync_assorted_links(&self, force: bool) -> MarketResult<SyncJobResult> {
        let run_key = Utc::now().format("%Y%m%d%H").to_string();
        if !force
            && !self
                .market
                .store()
                .claim_job_run(JOB_SYNC_LINKS, &run_key, serde_json::json!({}))
                .await?
        {
            return Ok(SyncJobResult {
                skipped: true,
                run_key,
                report: None,
            });
        }

        let report = self.ingestor.sync(&self.market, 10, 1).await?;
        Ok(SyncJobResult {
            skipped: false,
            run_key,
            report: Some(report),
        })
    }

    /// Apply curation rewards for one cycle, or for every settled cycle when
    /// unscoped. Claims one run per cycle id.
    pub async fn run_curation_rewards(
        &self,
        cycle_id: Option<&str>,
        force: bool,
        min_age_hours: i64,
    ) -> MarketResult<Vec<CurationJobResult>> {
        let targets = match cycle_id {
            Some(id) => vec![self.market.store().get_cycle(id).await?],
            None => self
                .market
                .store()
                .list_cycles(200)
                .await?
                .into_iter()
                .filter(|cycle| cycle.status == CycleStatus::Settled)
                .collect(),
        };

        let mut output = Vec::with_capacity(targets.len());
        for cycle in targets {
            if !force
                && !self
                    .market
                    .store()
                    .claim_job_run(JOB_CURATION_REWARDS, &cycle.id, serde_json::json!({}))
                    .await?
            {
                output.push(CurationJobResult {
                    cycle_id: cycle.id,
                    skipped: true,
                    outcome: None,
                });
                continue;
            }

            let outcome = self
                .market
                .apply_curation_rewards(&cycle.id, min_age_hours, force)
                .await?;
            output.push(CurationJobResult {
                cycle_id: cycle.id,
                skipped: false,
                outcome: Some(outcome),
            });
        }

        Ok(output)
    }
}
