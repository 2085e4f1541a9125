//! Config-driven model agents.
//!
//! Agents are selected by configuration from a registry of named
//! `ModelStrategy` variants; adding an agent means registering a variant,
//! never touching the validator or settlement path. Agent picks flow through
//! `MarketService::submit_picks` exactly like human picks, which is where
//! the mandatory-explanation rule is enforced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::market::config::{load_model_configs, ModelAgentConfig};
use crate::market::error::{MarketError, MarketResult};
use crate::market::service::MarketService;
use crate::market::storage::MarketStore;
use crate::market::types::ModelPrediction;
use crate::market::validator::MAX_PICKS_PER_CYCLE;
use crate::types::CandidateLink;

/// Capability set of a model agent: per-candidate probabilities plus an
/// explanation for each choice. Implementations are pure computation; any
/// provider I/O belongs outside the core.
pub trait ModelStrategy: Send + Sync {
    fn predict_probabilities(
        &self,
        config: &ModelAgentConfig,
        candidates: &[CandidateLink],
    ) -> HashMap<String, f64>;

    fn explain_choice(
        &self,
        config: &ModelAgentConfig,
        candidate: &CandidateLink,
        probability: f64,
        selected: bool,
    ) -> String;
}

/// Deterministic baseline: URL-hash score shaped by domain priors.
pub struct DefaultRankingStrategy;

impl DefaultRankingStrategy {
    fn domain_bonus(domain: &str) -> f64 {
        match domain {
            "ft.com" => 1.15,
            "economist.com" => 1.12,
            "arxiv.org" => 1.1,
            "bloomberg.com" => 1.08,
            "substack.com" => 1.05,
            _ => 1.0,
        }
    }
}

impl ModelStrategy for DefaultRankingStrategy {
    fn predict_probabilities(
        &self,
        config: &ModelAgentConfig,
        candidates: &[CandidateLink],
    ) -> HashMap<String, f64> {
        let mut raw_scores: HashMap<String, f64> = HashMap::new();
        for candidate in candidates {
            let digest =
                Sha256::digest(format!("{}:{}", config.id, candidate.canonical_url).as_bytes());
            let hex = format!("{digest:x}");
            // First 10 hex digits scaled into [0, 1).
            let base = u64::from_str_radix(&hex[..10], 16).unwrap_or(0) as f64 / 16f64.powi(10);
            let bonus = Self::domain_bonus(&candidate.domain);
            raw_scores.insert(candidate.id.clone(), ((0.5 + base) * bonus).max(0.0001));
        }

        let total: f64 = raw_scores.values().sum();
        if total <= 0.0 && !candidates.is_empty() {
            let uniform = 1.0 / candidates.len() as f64;
            return candidates
                .iter()
                .map(|candidate| (candidate.id.clone(), uniform))
                .collect();
        }

        raw_scores
            .into_iter()
            .map(|(id, score)| (id, score / total))
            .collect()
    }

    fn explain_choice(
        &self,
        config: &ModelAgentConfig,
        _candidate: &CandidateLink,
        probability: f64,
        selected: bool,
    ) -> String {
        let rounded = format!("{probability:.3}");
        if selected {
            format!(
                "{} selected this link because it scores well on likely assorted-links fit \
                 (domain relevance plus novelty signal). Assigned probability: {rounded}.",
                config.model_name
            )
        } else {
            format!(
                "{} evaluated this link but ranked it below the top {}. \
                 Assigned probability: {rounded}.",
                config.model_name, config.max_daily_picks
            )
        }
    }
}

/// Clamp negatives to zero and renormalize so a strategy's output is always
/// a distribution over every candidate, uniform when it degenerates.
pub fn normalize_probabilities(
    probabilities: &HashMap<String, f64>,
    candidates: &[CandidateLink],
) -> HashMap<String, f64> {
    let safe: HashMap<&str, f64> = candidates
        .iter()
        .map(|candidate| {
            let value = probabilities
                .get(&candidate.id)
                .copied()
                .unwrap_or(0.0)
                .max(0.0);
            (candidate.id.as_str(), value)
        })
        .collect();

    let total: f64 = safe.values().sum();
    if total <= 0.0 {
        let uniform = if candidates.is_empty() {
            0.0
        } else {
            1.0 / candidates.len() as f64
        };
        return candidates
            .iter()
            .map(|candidate| (candidate.id.clone(), uniform))
            .collect();
    }

    candidates
        .iter()
        .map(|candidate| {
            (
                candidate.id.clone(),
                safe[candidate.id.as_str()] / total,
            )
        })
        .collect()
}

/// One prediction row in a model run report.
#[derive(Debug, Clone)]
pub struct PredictionReport {
    pub candidate_id: String,
    pub probability: f64,
    pub explanation: String,
    pub selected: bool,
}

/// Outcome of one agent's run over a cycle.
#[derive(Debug, Clone)]
pub struct ModelRunReport {
    pub model_user_id: String,
    pub selected_count: usize,
    pub predictions: Vec<PredictionReport>,
}

/// Runs every enabled agent over a cycle.
pub struct ModelRunner {
    market: MarketService,
    config_path: PathBuf,
    configs: Vec<ModelAgentConfig>,
    strategies: HashMap<String, Arc<dyn ModelStrategy>>,
}

impl ModelRunner {
    pub const DEFAULT_STRATEGY: &'static str = "default";

    pub fn new(market: MarketService, config_path: impl Into<PathBuf>) -> MarketResult<Self> {
        let config_path = config_path.into();
        let configs = load_model_configs(&config_path)?;
        let mut strategies: HashMap<String, Arc<dyn ModelStrategy>> = HashMap::new();
        strategies.insert(
            Self::DEFAULT_STRATEGY.to_string(),
            Arc::new(DefaultRankingStrategy),
        );
        Ok(Self {
            market,
            config_path,
            configs,
            strategies,
        })
    }

    pub fn configs(&self) -> &[ModelAgentConfig] {
        &self.configs
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Register a strategy variant under a name configs can reference.
    pub fn register_strategy(&mut self, name: &str, strategy: Arc<dyn ModelStrategy>) {
        self.strategies.insert(name.to_string(), strategy);
    }

    /// Re-read the config file, picking up added or disabled agents.
    pub fn reload_configs(&mut self) -> MarketResult<&[ModelAgentConfig]> {
        self.configs = load_model_configs(&self.config_path)?;
        info!("Reloaded {} model agent configs", self.configs.len());
        Ok(&self.configs)
    }

    fn strategy_for(&self, config: &ModelAgentConfig) -> MarketResult<Arc<dyn ModelStrategy>> {
        let name = config
            .strategy
            .as_deref()
            .unwrap_or(Self::DEFAULT_STRATEGY);
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| MarketError::UnknownStrategy {
                name: name.to_string(),
            })
    }

    /// Run every enabled agent over the cycle: rank candidates, submit
    /// capped picks with explanations through the shared validation path,
    /// and upsert one prediction row per candidate.
    pub async fn run_cycle(
        &self,
        cycle_id: &str,
    ) -> MarketResult<HashMap<String, ModelRunReport>> {
        let candidates = self.market.store().list_candidates(cycle_id).await?;
        if candidates.is_empty() {
            return Ok(HashMap::new());
        }

        let mut output = HashMap::new();

        for config in &self.configs {
            if !config.enabled {
                continue;
            }

            let model_user = self.market.store().get_or_create_ai_user(&config.id).await?;
            let strategy = self.strategy_for(config)?;

            let raw = strategy.predict_probabilities(config, &candidates);
            let probabilities = normalize_probabilities(&raw, &candidates);

            let mut ranked: Vec<&CandidateLink> = candidates.iter().collect();
            ranked.sort_by(|a, b| probabilities[&b.id].total_cmp(&probabilities[&a.id]));

            let pick_cap = config
                .max_daily_picks
                .min(MAX_PICKS_PER_CYCLE)
                .min(ranked.len());
            let selected_ids: Vec<String> = ranked[..pick_cap]
                .iter()
                .map(|candidate| candidate.id.clone())
                .collect();

            let mut explanations: HashMap<String, String> = HashMap::new();
            let mut predictions = Vec::with_capacity(candidates.len());
            for candidate in &candidates {
                let selected = selected_ids.contains(&candidate.id);
                let probability = probabilities[&candidate.id];
                let explanation =
                    strategy.explain_choice(config, candidate, probability, selected);

                if selected {
                    if explanation.trim().is_empty() {
                        warn!(
                            "Agent {} produced no explanation for selected candidate {}",
                            config.id, candidate.id
                        );
                        return Err(MarketError::MissingExplanation {
                            candidate_id: candidate.id.clone(),
                        });
                    }
                    explanations.insert(candidate.id.clone(), explanation.clone());
                }

                predictions.push(PredictionReport {
                    candidate_id: candidate.id.clone(),
                    probability,
                    explanation,
                    selected,
                });
            }

            self.market
                .submit_picks(cycle_id, &model_user.id, &selected_ids, Some(&explanations))
                .await?;

            for prediction in &predictions {
                self.market
                    .store()
                    .upsert_model_prediction(&ModelPrediction {
                        cycle_id: cycle_id.to_string(),
                        model_user_id: model_user.id.clone(),
                        candidate_id: prediction.candidate_id.clone(),
                        probability: prediction.probability,
                        explanation: prediction.explanation.clone(),
                    })
                    .await?;
            }

            predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));
            info!(
                "Agent {} submitted {} picks for cycle {}",
                config.id,
                selected_ids.len(),
                cycle_id
            );
            output.insert(
                config.id.clone(),
                ModelRunReport {
                    model_user_id: model_user.id.clone(),
                    selected_count: selected_ids.len(),
                    predictions,
                },
            );
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, domain: &str) -> CandidateLink {
        CandidateLink {
            id: id.to_string(),
            cycle_id: "cyc_test".to_string(),
            submitted_by_user_id: "usr_test".to_string(),
            original_url: format!("https://{domain}/{id}"),
            canonical_url: format!("https://{domain}/{id}"),
            domain: domain.to_string(),
            title: id.to_string(),
            created_at: "2026-02-06T08:00:00Z".to_string(),
        }
    }

    fn config() -> ModelAgentConfig {
        ModelAgentConfig {
            id: "test-model".to_string(),
            provider: "local".to_string(),
            model_name: "test-model".to_string(),
            enabled: true,
            strategy_profile: "default".to_string(),
            max_daily_picks: 10,
            temperature: 0.2,
            strategy: None,
        }
    }

    #[test]
    fn default_strategy_yields_a_distribution() {
        let candidates = vec![
            candidate("a", "a.com"),
            candidate("b", "ft.com"),
            candidate("c", "c.com"),
        ];
        let probs = DefaultRankingStrategy.predict_probabilities(&config(), &candidates);
        let total: f64 = probs.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(probs.values().all(|p| *p > 0.0));
    }

    #[test]
    fn default_strategy_is_deterministic() {
        let candidates = vec![candidate("a", "a.com"), candidate("b", "b.com")];
        let first = DefaultRankingStrategy.predict_probabilities(&config(), &candidates);
        let second = DefaultRankingStrategy.predict_probabilities(&config(), &candidates);
        assert_eq!(first, second);
    }

    #[test]
    fn normalization_clamps_negatives_and_covers_all_candidates() {
        let candidates = vec![candidate("a", "a.com"), candidate("b", "b.com")];
        let mut raw = HashMap::new();
        raw.insert("a".to_string(), -0.5);
        let normalized = normalize_probabilities(&raw, &candidates);
        // Degenerate input falls back to uniform.
        assert!((normalized["a"] - 0.5).abs() < 1e-9);
        assert!((normalized["b"] - 0.5).abs() < 1e-9);
    }
}
