//! Config-driven model agents: loading, ranking picks, explanations.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::NaiveDate;
use link_market::market::{
    MarketError, MarketService, MarketStore, ModelAgentConfig, ModelRunner, ModelStrategy,
    SqliteStore,
};
use link_market::types::{AccountType, CandidateLink, Cycle};
use tempfile::NamedTempFile;

fn date(s: &str) -> NaiveDate {
    s.parse().expect("valid date")
}

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config file");
    write!(file, "{contents}").expect("write config");
    file
}

async fn setup() -> (MarketService, Cycle) {
    let store = Arc::new(
        SqliteStore::open_in_memory()
            .await
            .expect("Failed to open in-memory store"),
    );
    let market = MarketService::new(store.clone());

    let owner = store
        .create_user("Owner", "owner@example.com", AccountType::Human, date("2026-02-06"))
        .await
        .unwrap();
    let cycle = market.create_cycle(date("2026-02-06")).await.unwrap();

    for (url, title) in [
        ("https://a.com/1", "A"),
        ("https://b.com/2", "B"),
        ("https://c.com/3", "C"),
    ] {
        market
            .submit_candidate(&cycle.id, &owner.id, url, title)
            .await
            .unwrap();
    }

    (market, cycle)
}

const ONE_MODEL: &str = "\
models:
  - id: gpt-5.2
    provider: openai
    model_name: gpt-5.2
    enabled: true
    strategy_profile: default
    max_daily_picks: 10
    temperature: 0.2
";

#[tokio::test]
async fn model_run_generates_probabilities_and_explanations() {
    let (market, cycle) = setup().await;
    let config = config_file(ONE_MODEL);
    let runner = ModelRunner::new(market.clone(), config.path()).unwrap();

    let reports = runner.run_cycle(&cycle.id).await.unwrap();
    let report = reports.get("gpt-5.2").expect("report for gpt-5.2");

    assert!(report.selected_count <= 10);
    assert!(!report.predictions.is_empty());
    for prediction in report.predictions.iter().filter(|p| p.selected) {
        assert!(!prediction.explanation.trim().is_empty());
    }
    let total: f64 = report.predictions.iter().map(|p| p.probability).sum();
    assert!((total - 1.0).abs() < 1e-6);

    // The agent exists as an AI user and its picks landed through the
    // shared submission path.
    let model_user = market.store().get_user(&report.model_user_id).await.unwrap();
    assert_eq!(model_user.account_type, AccountType::Ai);
    assert_eq!(model_user.email, "model:gpt-5.2@local");
    let picks = market
        .store()
        .list_user_picks(&cycle.id, &report.model_user_id)
        .await
        .unwrap();
    assert_eq!(picks.len(), report.selected_count);

    let predictions = market
        .store()
        .list_model_predictions(&cycle.id, Some(report.model_user_id.as_str()))
        .await
        .unwrap();
    assert_eq!(predictions.len(), 3);
    assert!(predictions.iter().all(|p| !p.explanation.trim().is_empty()));

    // The unscoped listing covers the same cycle-wide rows.
    let all = market
        .store()
        .list_model_predictions(&cycle.id, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn pick_cap_respects_max_daily_picks() {
    let (market, cycle) = setup().await;
    let config = config_file(
        "\
models:
  - id: capped
    provider: local
    model_name: capped
    max_daily_picks: 2
",
    );
    let runner = ModelRunner::new(market.clone(), config.path()).unwrap();
    let reports = runner.run_cycle(&cycle.id).await.unwrap();
    assert_eq!(reports["capped"].selected_count, 2);
}

#[tokio::test]
async fn reload_picks_up_added_models() {
    let (market, _cycle) = setup().await;
    let config = config_file(ONE_MODEL);
    let mut runner = ModelRunner::new(market, config.path()).unwrap();
    assert_eq!(runner.configs().len(), 1);

    let two_models = format!(
        "{ONE_MODEL}  - id: gpt-5.1\n    provider: openai\n    model_name: gpt-5.1\n"
    );
    std::fs::write(config.path(), two_models).unwrap();

    let configs = runner.reload_configs().unwrap();
    let ids: Vec<&str> = configs.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"gpt-5.2"));
    assert!(ids.contains(&"gpt-5.1"));
}

#[tokio::test]
async fn disabled_models_are_skipped() {
    let (market, cycle) = setup().await;
    let config = config_file(
        "\
models:
  - id: off
    provider: local
    model_name: off
    enabled: false
",
    );
    let runner = ModelRunner::new(market, config.path()).unwrap();
    let reports = runner.run_cycle(&cycle.id).await.unwrap();
    assert!(reports.is_empty());
}

/// Strategy that refuses to explain itself; selected picks must fail.
struct BadExplanationStrategy;

impl ModelStrategy for BadExplanationStrategy {
    fn predict_probabilities(
        &self,
        _config: &ModelAgentConfig,
        candidates: &[CandidateLink],
    ) -> HashMap<String, f64> {
        let uniform = 1.0 / candidates.len().max(1) as f64;
        candidates
            .iter()
            .map(|candidate| (candidate.id.clone(), uniform))
            .collect()
    }

    fn explain_choice(
        &self,
        _config: &ModelAgentConfig,
        _candidate: &CandidateLink,
        _probability: f64,
        _selected: bool,
    ) -> String {
        String::new()
    }
}

#[tokio::test]
async fn selected_predictions_require_explanations() {
    let (market, cycle) = setup().await;
    let config = config_file(
        "\
models:
  - id: bad-model
    provider: local
    model_name: bad
    max_daily_picks: 2
    strategy: bad-explanations
",
    );
    let mut runner = ModelRunner::new(market, config.path()).unwrap();
    runner.register_strategy("bad-explanations", Arc::new(BadExplanationStrategy));

    let err = runner.run_cycle(&cycle.id).await.unwrap_err();
    assert!(matches!(err, MarketError::MissingExplanation { .. }));
}

#[tokio::test]
async fn unknown_strategy_names_fail_the_run() {
    let (market, cycle) = setup().await;
    let config = config_file(
        "\
models:
  - id: mystery
    provider: local
    model_name: mystery
    strategy: does-not-exist
",
    );
    let runner = ModelRunner::new(market, config.path()).unwrap();
    let err = runner.run_cycle(&cycle.id).await.unwrap_err();
    assert!(matches!(err, MarketError::UnknownStrategy { .. }));
}
