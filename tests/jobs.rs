//! Job claims make background runs idempotent per run key.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use link_market::ingest::{FeedIngestor, PageFetcher};
use link_market::market::{JobService, MarketService, MarketStore, ModelRunner, SqliteStore};
use link_market::types::AccountType;

struct EmptyFeedFetcher;

#[async_trait]
impl PageFetcher for EmptyFeedFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        if url.contains("/feed") {
            Ok("<rss version=\"2.0\"><channel></channel></rss>".to_string())
        } else {
            Err(anyhow!("unexpected fetch of {url}"))
        }
    }
}

fn date(s: &str) -> NaiveDate {
    s.parse().expect("valid date")
}

async fn setup() -> (Arc<SqliteStore>, JobService) {
    let store = Arc::new(
        SqliteStore::open_in_memory()
            .await
            .expect("Failed to open in-memory store"),
    );
    let market = MarketService::new(store.clone());
    let runner = ModelRunner::new(market.clone(), "/nonexistent/model_agents.yaml")
        .expect("runner without config");
    let ingestor = FeedIngestor::new(None, Arc::new(EmptyFeedFetcher));
    (store.clone(), JobService::new(market, runner, ingestor))
}

#[tokio::test]
async fn daily_faucet_job_runs_once_per_date() {
    let (store, jobs) = setup().await;
    store
        .create_user("Alice", "alice@example.com", AccountType::Human, date("2026-02-06"))
        .await
        .unwrap();

    let first = jobs
        .run_daily_faucet(Some(date("2026-02-08")), false)
        .await
        .unwrap();
    assert!(!first.skipped);
    assert_eq!(first.credited.len(), 1);
    assert_eq!(first.credited.values().sum::<i64>(), 20);

    let second = jobs
        .run_daily_faucet(Some(date("2026-02-08")), false)
        .await
        .unwrap();
    assert!(second.skipped);
    assert!(second.credited.is_empty());

    // Force reruns the job; the accrual itself is still a same-day no-op.
    let forced = jobs
        .run_daily_faucet(Some(date("2026-02-08")), true)
        .await
        .unwrap();
    assert!(!forced.skipped);
    assert!(forced.credited.is_empty());
}

#[tokio::test]
async fn model_job_skips_without_an_open_cycle() {
    let (_store, jobs) = setup().await;
    let result = jobs.run_models(None, false).await.unwrap();
    assert!(result.skipped);
    assert!(result.cycle_id.is_none());
}

#[tokio::test]
async fn sync_job_claims_an_hourly_run_key() {
    let (store, jobs) = setup().await;

    let first = jobs.sync_assorted_links(false).await.unwrap();
    assert!(!first.skipped);
    // Empty feed still guarantees an open cycle exists.
    assert!(store.get_open_cycle().await.unwrap().is_some());

    let second = jobs.sync_assorted_links(false).await.unwrap();
    assert!(second.skipped);
}

#[tokio::test]
async fn curation_job_covers_settled_cycles() {
    let (store, jobs) = setup().await;
    let market = MarketService::new(store.clone());
    let user = store
        .create_user("Alice", "alice@example.com", AccountType::Human, date("2026-02-06"))
        .await
        .unwrap();
    let cycle = market.create_cycle(date("2026-02-06")).await.unwrap();
    let link = market
        .submit_candidate(&cycle.id, &user.id, "https://example.com/a", "A")
        .await
        .unwrap();
    market.record_click(&link.id, "v1", None).await.unwrap();
    market
        .settle_cycle(&cycle.id, &[] as &[String])
        .await
        .unwrap();

    let results = jobs.run_curation_rewards(None, true, 24).await.unwrap();
    assert_eq!(results.len(), 1);
    let outcome = results[0].outcome.as_ref().expect("outcome");
    assert!(outcome.awarded());
    assert_eq!(outcome.rows[0].user_id, user.id);

    // A second pass never awards again.
    let results = jobs.run_curation_rewards(None, true, 24).await.unwrap();
    assert!(!results[0].outcome.as_ref().unwrap().awarded());
}
