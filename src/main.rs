//! Demo entry point for the link market engine.
//!
//! Walks one full cycle: users and candidates, ranked picks, live market
//! probabilities, settlement, clicks and curation rewards, and the daily
//! faucet. State persists in `market.db`.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use link_market::market::{MarketService, MarketStore, SqliteStore};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting link-market demo");

    let store = Arc::new(SqliteStore::open("./market.db").await?);
    let market = MarketService::new(store.clone());

    let today = Utc::now().date_naive();
    let alice = market
        .get_or_create_user("Alice", "alice@example.com", today)
        .await?;
    let bob = market
        .get_or_create_user("Bob", "bob@example.com", today)
        .await?;

    let cycle = match market.open_cycle().await? {
        Some(cycle) => cycle,
        None => market.create_cycle(today).await?,
    };
    info!("Using cycle {} ({})", cycle.id, cycle.cycle_date);

    let c1 = market
        .submit_candidate(
            &cycle.id,
            &alice.id,
            "https://example.com/economics-of-ai?utm_source=feed",
            "The economics of AI",
        )
        .await?;
    let c2 = market
        .submit_candidate(
            &cycle.id,
            &alice.id,
            "https://example.org/markets-in-everything",
            "Markets in everything",
        )
        .await?;
    let c3 = market
        .submit_candidate(
            &cycle.id,
            &bob.id,
            "https://example.net/claims-about-trade",
            "Claims about trade",
        )
        .await?;

    market
        .submit_picks(
            &cycle.id,
            &alice.id,
            &[c2.id.clone(), c1.id.clone(), c3.id.clone()],
            None,
        )
        .await?;
    market
        .submit_picks(&cycle.id, &bob.id, &[c2.id.clone(), c3.id.clone()], None)
        .await?;

    for row in market.market_probabilities(&cycle.id).await? {
        info!(
            "{}  weight={}  p={:.3}",
            row.url, row.rank_weight_score, row.market_probability
        );
    }

    // Readers click through Bob's link from two distinct visitors.
    market
        .record_click(&c3.id, "visitor-fingerprint-1", Some(alice.id.as_str()))
        .await?;
    market
        .record_click(&c3.id, "visitor-fingerprint-2", None)
        .await?;

    let summary = market
        .settle_cycle(&cycle.id, &[c2.original_url.clone(), c3.original_url.clone()])
        .await?;
    info!(
        "Settled cycle {}: {} winners",
        summary.cycle_id, summary.winner_count
    );
    for entry in &summary.ranking {
        info!(
            "  #{} {}  +{} chips ({} correct)",
            entry.rank, entry.user_id, entry.reward_chips, entry.correct_count
        );
    }

    let curation = market.apply_curation_rewards(&cycle.id, 24, true).await?;
    for row in &curation.rows {
        info!(
            "Curation reward: {} rank {} ({} unique clicks) +{} chips",
            row.user_id, row.rank, row.unique_clicks, row.reward_chips
        );
    }

    let credited = market.apply_daily_faucet(today).await?;
    info!("Faucet credited {} users", credited.len());

    for user_id in [&alice.id, &bob.id] {
        let user = market.store().get_user(user_id).await?;
        let audited = market.store().ledger_balance(user_id).await?;
        info!(
            "{}: {} chips (ledger fold {})",
            user.display_name, user.current_chips, audited
        );
    }

    info!("Demo complete; market.db holds the persistent state.");
    Ok(())
}
