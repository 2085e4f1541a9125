//! Core market rules: pick validation, probabilities, settlement, faucet.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use link_market::market::{
    EventType, MarketError, MarketService, MarketStore, SqliteStore,
};
use link_market::types::{AccountType, CandidateLink, Cycle, User};

struct Fixture {
    market: MarketService,
    alice: User,
    bob: User,
    cycle: Cycle,
    c1: CandidateLink,
    c2: CandidateLink,
    c3: CandidateLink,
}

fn date(s: &str) -> NaiveDate {
    s.parse().expect("valid date")
}

async fn setup() -> Fixture {
    let store = Arc::new(
        SqliteStore::open_in_memory()
            .await
            .expect("Failed to open in-memory store"),
    );
    let market = MarketService::new(store.clone());

    let alice = store
        .create_user("Alice", "alice@example.com", AccountType::Human, date("2026-02-06"))
        .await
        .expect("create alice");
    let bob = store
        .create_user("Bob", "bob@example.com", AccountType::Human, date("2026-02-06"))
        .await
        .expect("create bob");
    let cycle = market
        .create_cycle(date("2026-02-06"))
        .await
        .expect("create cycle");

    let c1 = market
        .submit_candidate(
            &cycle.id,
            &alice.id,
            "https://example.com/a?utm_source=x",
            "A",
        )
        .await
        .expect("candidate c1");
    let c2 = market
        .submit_candidate(&cycle.id, &alice.id, "https://example.com/b", "B")
        .await
        .expect("candidate c2");
    let c3 = market
        .submit_candidate(&cycle.id, &bob.id, "https://example.com/c", "C")
        .await
        .expect("candidate c3");

    Fixture {
        market,
        alice,
        bob,
        cycle,
        c1,
        c2,
        c3,
    }
}

#[tokio::test]
async fn max_picks_enforced() {
    let fx = setup().await;
    let mut ids = vec![fx.c1.id.clone(), fx.c2.id.clone(), fx.c3.id.clone()];
    for idx in 4..15 {
        let candidate = fx
            .market
            .submit_candidate(
                &fx.cycle.id,
                &fx.alice.id,
                &format!("https://example.com/{idx}"),
                &format!("{idx}"),
            )
            .await
            .expect("extra candidate");
        ids.push(candidate.id);
    }

    let err = fx
        .market
        .submit_picks(&fx.cycle.id, &fx.alice.id, &ids, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::TooManyPicks { .. }));

    // Nothing was stored.
    let picks = fx
        .market
        .store()
        .list_user_picks(&fx.cycle.id, &fx.alice.id)
        .await
        .unwrap();
    assert!(picks.is_empty());
}

#[tokio::test]
async fn duplicate_and_unknown_candidates_rejected() {
    let fx = setup().await;

    let err = fx
        .market
        .submit_picks(
            &fx.cycle.id,
            &fx.alice.id,
            &[fx.c1.id.clone(), fx.c1.id.clone()],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::DuplicateCandidate { .. }));

    let err = fx
        .market
        .submit_picks(
            &fx.cycle.id,
            &fx.alice.id,
            &["lnk_doesnotexist".to_string()],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::UnknownCandidate { .. }));
}

#[tokio::test]
async fn wrong_picks_have_no_loss_and_correct_rank_gets_reward() {
    let fx = setup().await;
    fx.market
        .submit_picks(
            &fx.cycle.id,
            &fx.alice.id,
            &[fx.c1.id.clone(), fx.c2.id.clone(), fx.c3.id.clone()],
            None,
        )
        .await
        .unwrap();

    let before = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(before.current_chips, 100);

    // Only candidate 1 won.
    let summary = fx
        .market
        .settle_cycle(&fx.cycle.id, &[fx.c1.original_url.clone()])
        .await
        .unwrap();
    assert_eq!(summary.winner_count, 1);

    let winners = fx
        .market
        .store()
        .list_winner_candidate_ids(&fx.cycle.id)
        .await
        .unwrap();
    assert_eq!(winners, vec![fx.c1.id.clone()]);

    // Rank 1 reward is +20; ranks 2 and 3 missed but cost nothing.
    let after = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(after.current_chips, 120);

    let ledger = fx.market.store().list_ledger(&fx.alice.id).await.unwrap();
    let reward = ledger
        .iter()
        .find(|entry| entry.event_type == EventType::PickReward)
        .expect("pick reward entry");
    assert_eq!(reward.chips_delta, 20);
    assert_eq!(reward.cycle_id.as_deref(), Some(fx.cycle.id.as_str()));
}

#[tokio::test]
async fn ordered_picks_are_ranked_by_position() {
    let fx = setup().await;
    // Submit [B, A, C]: B takes rank 1, A rank 2, C rank 3.
    fx.market
        .submit_picks(
            &fx.cycle.id,
            &fx.alice.id,
            &[fx.c2.id.clone(), fx.c1.id.clone(), fx.c3.id.clone()],
            None,
        )
        .await
        .unwrap();

    let picks = fx
        .market
        .store()
        .list_user_picks(&fx.cycle.id, &fx.alice.id)
        .await
        .unwrap();
    assert_eq!(picks.len(), 3);
    assert_eq!(picks[0].candidate_id, fx.c2.id);
    assert_eq!(picks[0].rank, 1);
    assert_eq!(picks[1].candidate_id, fx.c1.id);
    assert_eq!(picks[1].rank, 2);
    assert_eq!(picks[2].candidate_id, fx.c3.id);
    assert_eq!(picks[2].rank, 3);

    // A and B win: 20 (rank 1, B) + 18 (rank 2, A) = 38; C contributes 0.
    fx.market
        .settle_cycle(
            &fx.cycle.id,
            &[fx.c1.original_url.clone(), fx.c2.original_url.clone()],
        )
        .await
        .unwrap();
    let after = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(after.current_chips, 100 + 38);
}

#[tokio::test]
async fn resubmitting_picks_overwrites_the_previous_set() {
    let fx = setup().await;
    fx.market
        .submit_picks(
            &fx.cycle.id,
            &fx.alice.id,
            &[fx.c1.id.clone(), fx.c2.id.clone()],
            None,
        )
        .await
        .unwrap();
    fx.market
        .submit_picks(&fx.cycle.id, &fx.alice.id, &[fx.c3.id.clone()], None)
        .await
        .unwrap();

    let picks = fx
        .market
        .store()
        .list_user_picks(&fx.cycle.id, &fx.alice.id)
        .await
        .unwrap();
    assert_eq!(picks.len(), 1);
    assert_eq!(picks[0].candidate_id, fx.c3.id);
    assert_eq!(picks[0].rank, 1);
}

#[tokio::test]
async fn market_probability_uses_rank_weights() {
    let fx = setup().await;
    // Alice: c1 rank 1, c2 rank 2. Bob: c1 rank 1, c3 rank 2.
    fx.market
        .submit_picks(
            &fx.cycle.id,
            &fx.alice.id,
            &[fx.c1.id.clone(), fx.c2.id.clone()],
            None,
        )
        .await
        .unwrap();
    fx.market
        .submit_picks(
            &fx.cycle.id,
            &fx.bob.id,
            &[fx.c1.id.clone(), fx.c3.id.clone()],
            None,
        )
        .await
        .unwrap();

    let rows = fx.market.market_probabilities(&fx.cycle.id).await.unwrap();
    let by_id: HashMap<&str, f64> = rows
        .iter()
        .map(|row| (row.candidate_id.as_str(), row.market_probability))
        .collect();

    // weights: c1 = 10 + 10 = 20, c2 = 9, c3 = 9, total = 38
    assert!((by_id[fx.c1.id.as_str()] - 20.0 / 38.0).abs() < 1e-6);
    assert!((by_id[fx.c2.id.as_str()] - 9.0 / 38.0).abs() < 1e-6);
    assert!((by_id[fx.c3.id.as_str()] - 9.0 / 38.0).abs() < 1e-6);

    let total: f64 = rows.iter().map(|row| row.market_probability).sum();
    assert!((total - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn probabilities_are_zero_before_any_picks() {
    let fx = setup().await;
    let rows = fx.market.market_probabilities(&fx.cycle.id).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.market_probability == 0.0));
    assert!(rows.iter().all(|row| row.rank_weight_score == 0));
}

#[tokio::test]
async fn settling_twice_fails_cleanly_without_double_credit() {
    let fx = setup().await;
    fx.market
        .submit_picks(&fx.cycle.id, &fx.alice.id, &[fx.c1.id.clone()], None)
        .await
        .unwrap();

    fx.market
        .settle_cycle(&fx.cycle.id, &[fx.c1.original_url.clone()])
        .await
        .unwrap();
    let after_first = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(after_first.current_chips, 120);

    let err = fx
        .market
        .settle_cycle(&fx.cycle.id, &[fx.c1.original_url.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::AlreadySettled { .. }));

    let after_second = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(after_second.current_chips, 120);
    // The cached balance still matches the ledger fold.
    let audited = fx.market.store().ledger_balance(&fx.alice.id).await.unwrap();
    assert_eq!(audited, after_second.current_chips);
}

#[tokio::test]
async fn settled_cycle_rejects_picks_and_candidates() {
    let fx = setup().await;
    fx.market
        .settle_cycle(&fx.cycle.id, &[fx.c1.original_url.clone()])
        .await
        .unwrap();

    let err = fx
        .market
        .submit_picks(&fx.cycle.id, &fx.alice.id, &[fx.c1.id.clone()], None)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::CycleClosed { .. }));

    let err = fx
        .market
        .submit_candidate(&fx.cycle.id, &fx.alice.id, "https://example.com/late", "Late")
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::CycleClosed { .. }));
}

#[tokio::test]
async fn same_canonical_url_dedupes_within_a_cycle() {
    let fx = setup().await;
    let c4 = fx
        .market
        .submit_candidate(
            &fx.cycle.id,
            &fx.alice.id,
            "https://news.site.com/alpha?utm_campaign=test",
            "Alpha",
        )
        .await
        .unwrap();
    let c5 = fx
        .market
        .submit_candidate(&fx.cycle.id, &fx.alice.id, "https://news.site.com/beta", "Beta")
        .await
        .unwrap();
    assert_ne!(c4.id, c5.id);

    // Same canonical link submitted by someone else resolves to the original.
    let c6 = fx
        .market
        .submit_candidate(
            &fx.cycle.id,
            &fx.bob.id,
            "https://news.site.com/alpha?utm_source=abc",
            "Alpha Dup",
        )
        .await
        .unwrap();
    assert_eq!(c4.id, c6.id);
}

#[tokio::test]
async fn new_user_starts_with_signup_bonus_and_no_same_day_faucet() {
    let fx = setup().await;
    let user = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(user.current_chips, 100);
    assert_eq!(user.last_daily_credit_date, date("2026-02-06"));

    let ledger = fx.market.store().list_ledger(&fx.alice.id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].event_type, EventType::SignupBonus);
    assert_eq!(ledger[0].chips_delta, 100);

    // Same-day faucet is a no-op.
    let credited = fx
        .market
        .run_faucet(&fx.alice.id, date("2026-02-06"))
        .await
        .unwrap();
    assert_eq!(credited, 0);
    let user = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(user.current_chips, 100);
}

#[tokio::test]
async fn faucet_accumulates_missed_days_and_is_idempotent() {
    let fx = setup().await;
    let credited = fx
        .market
        .apply_daily_faucet(date("2026-02-09"))
        .await
        .unwrap();
    assert_eq!(credited[&fx.alice.id], 30);
    assert_eq!(credited[&fx.bob.id], 30);

    let alice = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(alice.current_chips, 130);
    assert_eq!(alice.last_daily_credit_date, date("2026-02-09"));

    // Rerun on the same day credits nothing.
    let rerun = fx
        .market
        .apply_daily_faucet(date("2026-02-09"))
        .await
        .unwrap();
    assert!(rerun.is_empty());
    let alice = fx.market.store().get_user(&fx.alice.id).await.unwrap();
    assert_eq!(alice.current_chips, 130);

    let ledger = fx.market.store().list_ledger(&fx.alice.id).await.unwrap();
    let faucet_entries: Vec<_> = ledger
        .iter()
        .filter(|entry| entry.event_type == EventType::DailyFaucet)
        .collect();
    assert_eq!(faucet_entries.len(), 1);
    assert_eq!(faucet_entries[0].chips_delta, 30);
    assert_eq!(faucet_entries[0].metadata["missed_days"], 3);
}

#[tokio::test]
async fn open_cycle_is_a_query_over_status() {
    let fx = setup().await;
    assert!(fx.market.store().health_check().await.unwrap());

    let open = fx.market.open_cycle().await.unwrap().expect("open cycle");
    assert_eq!(open.id, fx.cycle.id);

    fx.market
        .settle_cycle(&fx.cycle.id, &[fx.c1.original_url.clone()])
        .await
        .unwrap();
    assert!(fx.market.open_cycle().await.unwrap().is_none());

    let next = fx.market.create_cycle(date("2026-02-07")).await.unwrap();
    let open = fx.market.open_cycle().await.unwrap().expect("open cycle");
    assert_eq!(open.id, next.id);
}
