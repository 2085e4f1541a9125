//! Storage abstraction for the market engine.
//!
//! `MarketStore` is the formal contract for persistence; the engine treats it
//! as the only suspension point. `SqliteStore` implements it over SQLite with
//! the schema created idempotently on open. Multi-row writes run inside a
//! transaction, and the cycle row doubles as the single-writer gate: pick
//! overwrites and settlement both start with a guarded UPDATE of the cycle
//! status, so a lost race surfaces as `CycleClosed` / `AlreadySettled` with
//! no partial effects.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use tracing::{debug, info};
use uuid::Uuid;

use crate::market::error::{MarketError, MarketResult};
use crate::market::types::{
    ChipLedgerEntry, ClickOutcome, CurationReward, EventType, ModelPrediction, SettlementCredit,
    SubmitterClicks,
};
use crate::types::{AccountType, CandidateLink, Cycle, CycleStatus, Pick, User};
use crate::urls::{canonicalize_url, extract_domain};

/// Formal contract for persistent market state. All balance mutation flows
/// through ledger-writing methods; nothing edits `current_chips` directly.
#[async_trait]
pub trait MarketStore: Send + Sync {
    // Users and ledger
    async fn create_user(
        &self,
        display_name: &str,
        email: &str,
        account_type: AccountType,
        created_on: NaiveDate,
    ) -> MarketResult<User>;
    async fn get_user(&self, user_id: &str) -> MarketResult<User>;
    async fn get_user_by_email(&self, email: &str) -> MarketResult<Option<User>>;
    async fn get_or_create_ai_user(&self, model_id: &str) -> MarketResult<User>;
    async fn list_users(&self) -> MarketResult<Vec<User>>;
    async fn credit_chips(
        &self,
        user_id: &str,
        chips_delta: i64,
        event_type: EventType,
        cycle_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> MarketResult<()>;
    async fn list_ledger(&self, user_id: &str) -> MarketResult<Vec<ChipLedgerEntry>>;
    /// Fold of all ledger entries for the user; the audit view of the cached
    /// balance.
    async fn ledger_balance(&self, user_id: &str) -> MarketResult<i64>;
    /// Apply a faucet credit and advance the watermark in one transaction.
    /// Guarded on the expected previous watermark; returns false when another
    /// accrual won the race.
    async fn faucet_credit(
        &self,
        user_id: &str,
        chips: i64,
        missed_days: i64,
        expected_last: NaiveDate,
        as_of: NaiveDate,
    ) -> MarketResult<bool>;

    // Cycles
    async fn create_cycle(&self, cycle_date: NaiveDate) -> MarketResult<Cycle>;
    async fn get_cycle(&self, cycle_id: &str) -> MarketResult<Cycle>;
    async fn list_cycles(&self, limit: i64) -> MarketResult<Vec<Cycle>>;
    /// Latest OPEN cycle, an explicit query rather than process state.
    async fn get_open_cycle(&self) -> MarketResult<Option<Cycle>>;

    // Candidates
    async fn create_candidate(
        &self,
        cycle_id: &str,
        submitted_by_user_id: &str,
        url: &str,
        title: &str,
    ) -> MarketResult<CandidateLink>;
    async fn get_candidate(&self, candidate_id: &str) -> MarketResult<CandidateLink>;
    async fn list_candidates(&self, cycle_id: &str) -> MarketResult<Vec<CandidateLink>>;

    // Picks
    /// Full overwrite of the user's pick set for the cycle, re-ranked by list
    /// position. Fails `CycleClosed` when the cycle is no longer OPEN at
    /// commit time.
    async fn replace_picks(
        &self,
        cycle_id: &str,
        user_id: &str,
        candidate_ids: &[String],
    ) -> MarketResult<Vec<Pick>>;
    async fn list_user_picks(&self, cycle_id: &str, user_id: &str) -> MarketResult<Vec<Pick>>;
    async fn list_picks(&self, cycle_id: &str) -> MarketResult<Vec<Pick>>;

    // Settlement
    /// Atomically flip the cycle OPEN -> SETTLED, write one result row per
    /// candidate and apply all reward credits. Fails `AlreadySettled` when
    /// the status flip finds no OPEN row, leaving nothing applied.
    async fn commit_settlement(
        &self,
        cycle_id: &str,
        results: &[(String, bool)],
        credits: &[SettlementCredit],
    ) -> MarketResult<()>;
    async fn list_winner_candidate_ids(&self, cycle_id: &str) -> MarketResult<Vec<String>>;

    // Clicks and curation
    async fn record_click(
        &self,
        candidate_id: &str,
        fingerprint_source: &str,
        clicked_by_user_id: Option<&str>,
    ) -> MarketResult<ClickOutcome>;
    async fn has_curation_rewards(&self, cycle_id: &str) -> MarketResult<bool>;
    /// Unique clicks per submitter, ordered clicks desc, earliest candidate
    /// submission asc, user id asc. Zero-click submitters are excluded.
    async fn curation_click_totals(&self, cycle_id: &str) -> MarketResult<Vec<SubmitterClicks>>;
    /// Write reward rows and their ledger credits in one transaction.
    /// Returns false when the (cycle, user) primary key reports the cycle
    /// was already rewarded, applying nothing.
    async fn insert_curation_rewards(
        &self,
        cycle_id: &str,
        rows: &[CurationReward],
    ) -> MarketResult<bool>;
    async fn list_curation_rewards(&self, cycle_id: &str) -> MarketResult<Vec<CurationReward>>;

    // Model predictions
    async fn upsert_model_prediction(&self, prediction: &ModelPrediction) -> MarketResult<()>;
    async fn list_model_predictions(
        &self,
        cycle_id: &str,
        model_user_id: Option<&str>,
    ) -> MarketResult<Vec<ModelPrediction>>;

    // Feed ingestion
    async fn upsert_archive_link(
        &self,
        post_date: &str,
        url: &str,
        title: &str,
        source_post_url: &str,
    ) -> MarketResult<()>;
    async fn source_post_seen(&self, source_post_url: &str) -> MarketResult<bool>;
    async fn mark_source_post_processed(
        &self,
        source_post_url: &str,
        title: &str,
        published_at: &str,
        extracted_links: &[String],
    ) -> MarketResult<()>;

    // Background jobs
    /// Claim an idempotent job run; false when (job_name, run_key) already
    /// ran.
    async fn claim_job_run(
        &self,
        job_name: &str,
        run_key: &str,
        details: serde_json::Value,
    ) -> MarketResult<bool>;

    async fn health_check(&self) -> MarketResult<bool>;
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn new_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..12])
}

fn fingerprint_hash(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    format!("{digest:x}")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(FromRow)]
struct UserRow {
    id: String,
    display_name: String,
    email: String,
    account_type: String,
    current_chips: i64,
    created_at: String,
    last_daily_credit_date: String,
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        Ok(User {
            account_type: AccountType::parse(&self.account_type)?,
            last_daily_credit_date: self
                .last_daily_credit_date
                .parse()
                .with_context(|| format!("bad last_daily_credit_date for user {}", self.id))?,
            id: self.id,
            display_name: self.display_name,
            email: self.email,
            current_chips: self.current_chips,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct CycleRow {
    id: String,
    cycle_date: String,
    status: String,
    opened_at: String,
    closed_at: Option<String>,
}

impl CycleRow {
    fn into_cycle(self) -> Result<Cycle> {
        Ok(Cycle {
            cycle_date: self
                .cycle_date
                .parse()
                .with_context(|| format!("bad cycle_date for cycle {}", self.id))?,
            status: CycleStatus::parse(&self.status)?,
            id: self.id,
            opened_at: self.opened_at,
            closed_at: self.closed_at,
        })
    }
}

#[derive(FromRow)]
struct CandidateRow {
    id: String,
    cycle_id: String,
    submitted_by_user_id: String,
    original_url: String,
    canonical_url: String,
    domain: String,
    title: String,
    created_at: String,
}

impl CandidateRow {
    fn into_candidate(self) -> CandidateLink {
        CandidateLink {
            id: self.id,
            cycle_id: self.cycle_id,
            submitted_by_user_id: self.submitted_by_user_id,
            original_url: self.original_url,
            canonical_url: self.canonical_url,
            domain: self.domain,
            title: self.title,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct PickRow {
    id: String,
    cycle_id: String,
    user_id: String,
    candidate_id: String,
    rank: i64,
    picked_at: String,
}

impl PickRow {
    fn into_pick(self) -> Pick {
        Pick {
            id: self.id,
            cycle_id: self.cycle_id,
            user_id: self.user_id,
            candidate_id: self.candidate_id,
            rank: self.rank as u8,
            picked_at: self.picked_at,
        }
    }
}

#[derive(FromRow)]
struct LedgerRow {
    id: String,
    user_id: String,
    cycle_id: Option<String>,
    event_type: String,
    chips_delta: i64,
    metadata: Option<String>,
    created_at: String,
}

impl LedgerRow {
    fn into_entry(self) -> Result<ChipLedgerEntry> {
        Ok(ChipLedgerEntry {
            event_type: EventType::parse(&self.event_type)?,
            metadata: match self.metadata.as_deref() {
                Some(raw) => serde_json::from_str(raw)
                    .with_context(|| format!("bad ledger metadata for entry {}", self.id))?,
                None => serde_json::Value::Null,
            },
            id: self.id,
            user_id: self.user_id,
            cycle_id: self.cycle_id,
            chips_delta: self.chips_delta,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct PredictionRow {
    cycle_id: String,
    model_user_id: String,
    candidate_id: String,
    probability: f64,
    explanation: String,
}

#[derive(FromRow)]
struct CurationRewardRow {
    cycle_id: String,
    user_id: String,
    rank: i64,
    unique_clicks: i64,
    reward_chips: i64,
}

#[derive(FromRow)]
struct SubmitterClicksRow {
    user_id: String,
    unique_clicks: i64,
    first_submitted_at: String,
}

/// SQLite implementation of the `MarketStore` contract.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if necessary) a file-backed store.
    pub async fn open(db_path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{db_path}?mode=rwc"))
            .await
            .context("Failed to connect to SQLite database")?;

        Self::create_schema(&pool).await?;
        info!("SqliteStore initialized and connected to {}", db_path);
        Ok(Self { pool })
    }

    /// Open an in-memory store; one connection so the database survives for
    /// the pool's lifetime. Intended for tests and demos.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                account_type TEXT NOT NULL CHECK(account_type IN ('HUMAN', 'AI')),
                current_chips INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_daily_credit_date TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chip_ledger (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                cycle_id TEXT,
                event_type TEXT NOT NULL,
                chips_delta INTEGER NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cycles (
                id TEXT PRIMARY KEY,
                cycle_date TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('OPEN', 'SETTLED')),
                opened_at TEXT NOT NULL,
                closed_at TEXT
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS candidate_links (
                id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL,
                submitted_by_user_id TEXT NOT NULL,
                original_url TEXT NOT NULL,
                canonical_url TEXT NOT NULL,
                domain TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(cycle_id, canonical_url),
                FOREIGN KEY(cycle_id) REFERENCES cycles(id),
                FOREIGN KEY(submitted_by_user_id) REFERENCES users(id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS picks (
                id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                rank INTEGER NOT NULL,
                picked_at TEXT NOT NULL,
                UNIQUE(cycle_id, user_id, rank),
                UNIQUE(cycle_id, user_id, candidate_id),
                FOREIGN KEY(cycle_id) REFERENCES cycles(id),
                FOREIGN KEY(user_id) REFERENCES users(id),
                FOREIGN KEY(candidate_id) REFERENCES candidate_links(id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cycle_results (
                cycle_id TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                is_winner INTEGER NOT NULL,
                PRIMARY KEY(cycle_id, candidate_id),
                FOREIGN KEY(cycle_id) REFERENCES cycles(id),
                FOREIGN KEY(candidate_id) REFERENCES candidate_links(id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS click_events (
                id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                clicked_by_user_id TEXT,
                fingerprint_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(candidate_id, fingerprint_hash),
                FOREIGN KEY(cycle_id) REFERENCES cycles(id),
                FOREIGN KEY(candidate_id) REFERENCES candidate_links(id),
                FOREIGN KEY(clicked_by_user_id) REFERENCES users(id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS curation_rewards (
                cycle_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                rank INTEGER NOT NULL,
                unique_clicks INTEGER NOT NULL,
                reward_chips INTEGER NOT NULL,
                awarded_at TEXT NOT NULL,
                PRIMARY KEY(cycle_id, user_id),
                FOREIGN KEY(cycle_id) REFERENCES cycles(id),
                FOREIGN KEY(user_id) REFERENCES users(id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS model_predictions (
                cycle_id TEXT NOT NULL,
                model_user_id TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                probability REAL NOT NULL,
                explanation TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY(cycle_id, model_user_id, candidate_id),
                FOREIGN KEY(cycle_id) REFERENCES cycles(id),
                FOREIGN KEY(model_user_id) REFERENCES users(id),
                FOREIGN KEY(candidate_id) REFERENCES candidate_links(id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS source_posts (
                id TEXT PRIMARY KEY,
                source_post_url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                published_at TEXT NOT NULL,
                extracted_links_json TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS archive_links (
                id TEXT PRIMARY KEY,
                post_date TEXT NOT NULL,
                url TEXT NOT NULL,
                canonical_url TEXT NOT NULL,
                domain TEXT NOT NULL,
                title TEXT NOT NULL,
                source_post_url TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(post_date, canonical_url)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                job_name TEXT NOT NULL,
                run_key TEXT NOT NULL,
                status TEXT NOT NULL,
                details_json TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(job_name, run_key)
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_cycles_status ON cycles(status);",
            "CREATE INDEX IF NOT EXISTS idx_candidate_cycle ON candidate_links(cycle_id);",
            "CREATE INDEX IF NOT EXISTS idx_picks_cycle ON picks(cycle_id);",
            "CREATE INDEX IF NOT EXISTS idx_ledger_user ON chip_ledger(user_id);",
            "CREATE INDEX IF NOT EXISTS idx_clicks_cycle_candidate ON click_events(cycle_id, candidate_id);",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(pool)
                .await
                .context("Failed to create market schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl MarketStore for SqliteStore {
    async fn create_user(
        &self,
        display_name: &str,
        email: &str,
        account_type: AccountType,
        created_on: NaiveDate,
    ) -> MarketResult<User> {
        let user_id = new_id("usr");
        let now = now_iso();
        let mut tx = self.pool.begin().await.context("begin create_user")?;

        sqlx::query(
            r#"
            INSERT INTO users(id, display_name, email, account_type, current_chips, created_at, last_daily_credit_date)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user_id)
        .bind(display_name)
        .bind(email)
        .bind(account_type.as_str())
        .bind(crate::market::faucet::STARTING_CHIPS)
        .bind(&now)
        .bind(created_on.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to insert user")?;

        sqlx::query(
            r#"
            INSERT INTO chip_ledger(id, user_id, cycle_id, event_type, chips_delta, metadata, created_at)
            VALUES (?, ?, NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(new_id("led"))
        .bind(&user_id)
        .bind(EventType::SignupBonus.as_str())
        .bind(crate::market::faucet::STARTING_CHIPS)
        .bind(serde_json::json!({"reason": "starting_chips"}).to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert signup bonus ledger entry")?;

        tx.commit().await.context("commit create_user")?;
        debug!("Created {} user {} ({})", account_type.as_str(), user_id, email);
        self.get_user(&user_id).await
    }

    async fn get_user(&self, user_id: &str) -> MarketResult<User> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;
        match row {
            Some(row) => Ok(row.into_user()?),
            None => Err(MarketError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            }),
        }
    }

    async fn get_user_by_email(&self, email: &str) -> MarketResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by email")?;
        Ok(row.map(UserRow::into_user).transpose()?)
    }

    async fn get_or_create_ai_user(&self, model_id: &str) -> MarketResult<User> {
        let email = format!("model:{model_id}@local");
        if let Some(existing) = self.get_user_by_email(&email).await? {
            return Ok(existing);
        }
        self.create_user(model_id, &email, AccountType::Ai, Utc::now().date_naive())
            .await
    }

    async fn list_users(&self) -> MarketResult<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM users ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list users")?;
        Ok(rows
            .into_iter()
            .map(UserRow::into_user)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn credit_chips(
        &self,
        user_id: &str,
        chips_delta: i64,
        event_type: EventType,
        cycle_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> MarketResult<()> {
        let mut tx = self.pool.begin().await.context("begin credit_chips")?;
        if chips_delta != 0 {
            sqlx::query("UPDATE users SET current_chips = current_chips + ? WHERE id = ?")
                .bind(chips_delta)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .context("Failed to update cached balance")?;
        }
        sqlx::query(
            r#"
            INSERT INTO chip_ledger(id, user_id, cycle_id, event_type, chips_delta, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new_id("led"))
        .bind(user_id)
        .bind(cycle_id)
        .bind(event_type.as_str())
        .bind(chips_delta)
        .bind(metadata.to_string())
        .bind(now_iso())
        .execute(&mut *tx)
        .await
        .context("Failed to append ledger entry")?;
        tx.commit().await.context("commit credit_chips")?;
        Ok(())
    }

    async fn list_ledger(&self, user_id: &str) -> MarketResult<Vec<ChipLedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT * FROM chip_ledger WHERE user_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list ledger entries")?;
        Ok(rows
            .into_iter()
            .map(LedgerRow::into_entry)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn ledger_balance(&self, user_id: &str) -> MarketResult<i64> {
        let total: (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(chips_delta), 0) FROM chip_ledger WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to fold ledger balance")?;
        Ok(total.0)
    }

    async fn faucet_credit(
        &self,
        user_id: &str,
        chips: i64,
        missed_days: i64,
        expected_last: NaiveDate,
        as_of: NaiveDate,
    ) -> MarketResult<bool> {
        let mut tx = self.pool.begin().await.context("begin faucet_credit")?;
        let updated = sqlx::query(
            r#"
            UPDATE users
            SET current_chips = current_chips + ?, last_daily_credit_date = ?
            WHERE id = ? AND last_daily_credit_date = ?
            "#,
        )
        .bind(chips)
        .bind(as_of.to_string())
        .bind(user_id)
        .bind(expected_last.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to advance faucet watermark")?
        .rows_affected();

        if updated == 0 {
            // Another accrual advanced the watermark first; credit nothing.
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO chip_ledger(id, user_id, cycle_id, event_type, chips_delta, metadata, created_at)
            VALUES (?, ?, NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(new_id("led"))
        .bind(user_id)
        .bind(EventType::DailyFaucet.as_str())
        .bind(chips)
        .bind(serde_json::json!({"missed_days": missed_days}).to_string())
        .bind(now_iso())
        .execute(&mut *tx)
        .await
        .context("Failed to append faucet ledger entry")?;

        tx.commit().await.context("commit faucet_credit")?;
        Ok(true)
    }

    async fn create_cycle(&self, cycle_date: NaiveDate) -> MarketResult<Cycle> {
        let cycle_id = new_id("cyc");
        sqlx::query(
            r#"
            INSERT INTO cycles(id, cycle_date, status, opened_at, closed_at)
            VALUES (?, ?, 'OPEN', ?, NULL)
            "#,
        )
        .bind(&cycle_id)
        .bind(cycle_date.to_string())
        .bind(now_iso())
        .execute(&self.pool)
        .await
        .context("Failed to insert cycle")?;
        info!("Opened cycle {} for {}", cycle_id, cycle_date);
        self.get_cycle(&cycle_id).await
    }

    async fn get_cycle(&self, cycle_id: &str) -> MarketResult<Cycle> {
        let row: Option<CycleRow> = sqlx::query_as("SELECT * FROM cycles WHERE id = ?")
            .bind(cycle_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch cycle")?;
        match row {
            Some(row) => Ok(row.into_cycle()?),
            None => Err(MarketError::NotFound {
                entity: "cycle",
                id: cycle_id.to_string(),
            }),
        }
    }

    async fn list_cycles(&self, limit: i64) -> MarketResult<Vec<Cycle>> {
        let rows: Vec<CycleRow> =
            sqlx::query_as("SELECT * FROM cycles ORDER BY opened_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .context("Failed to list cycles")?;
        Ok(rows
            .into_iter()
            .map(CycleRow::into_cycle)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn get_open_cycle(&self) -> MarketResult<Option<Cycle>> {
        let row: Option<CycleRow> = sqlx::query_as(
            "SELECT * FROM cycles WHERE status = 'OPEN' ORDER BY opened_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch open cycle")?;
        Ok(row.map(CycleRow::into_cycle).transpose()?)
    }

    async fn create_candidate(
        &self,
        cycle_id: &str,
        submitted_by_user_id: &str,
        url: &str,
        title: &str,
    ) -> MarketResult<CandidateLink> {
        let candidate_id = new_id("lnk");
        let canonical = canonicalize_url(url)?;
        let domain = extract_domain(&canonical);

        let inserted = sqlx::query(
            r#"
            INSERT INTO candidate_links(
                id, cycle_id, submitted_by_user_id, original_url, canonical_url, domain, title, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&candidate_id)
        .bind(cycle_id)
        .bind(submitted_by_user_id)
        .bind(url)
        .bind(&canonical)
        .bind(&domain)
        .bind(title)
        .bind(now_iso())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => self.get_candidate(&candidate_id).await,
            Err(err) if is_unique_violation(&err) => {
                // Same canonical URL already competes in this cycle; hand the
                // submitter the existing candidate instead of an error.
                let row: Option<CandidateRow> = sqlx::query_as(
                    "SELECT * FROM candidate_links WHERE cycle_id = ? AND canonical_url = ?",
                )
                .bind(cycle_id)
                .bind(&canonical)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch deduplicated candidate")?;
                match row {
                    Some(row) => Ok(row.into_candidate()),
                    None => Err(MarketError::Storage(err.into())),
                }
            }
            Err(err) => Err(MarketError::Storage(
                anyhow::Error::from(err).context("Failed to insert candidate"),
            )),
        }
    }

    async fn get_candidate(&self, candidate_id: &str) -> MarketResult<CandidateLink> {
        let row: Option<CandidateRow> = sqlx::query_as("SELECT * FROM candidate_links WHERE id = ?")
            .bind(candidate_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch candidate")?;
        match row {
            Some(row) => Ok(row.into_candidate()),
            None => Err(MarketError::NotFound {
                entity: "candidate",
                id: candidate_id.to_string(),
            }),
        }
    }

    async fn list_candidates(&self, cycle_id: &str) -> MarketResult<Vec<CandidateLink>> {
        let rows: Vec<CandidateRow> = sqlx::query_as(
            "SELECT * FROM candidate_links WHERE cycle_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list candidates")?;
        Ok(rows.into_iter().map(CandidateRow::into_candidate).collect())
    }

    async fn replace_picks(
        &self,
        cycle_id: &str,
        user_id: &str,
        candidate_ids: &[String],
    ) -> MarketResult<Vec<Pick>> {
        let mut tx = self.pool.begin().await.context("begin replace_picks")?;

        // Touching the cycle row takes the write lock and re-checks OPEN, so
        // an overwrite cannot interleave with settlement.
        let open = sqlx::query("UPDATE cycles SET status = status WHERE id = ? AND status = 'OPEN'")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await
            .context("Failed to gate pick overwrite on cycle status")?
            .rows_affected();
        if open == 0 {
            drop(tx);
            // Distinguish a vanished cycle from a settled one.
            self.get_cycle(cycle_id).await?;
            return Err(MarketError::CycleClosed {
                cycle_id: cycle_id.to_string(),
            });
        }

        sqlx::query("DELETE FROM picks WHERE cycle_id = ? AND user_id = ?")
            .bind(cycle_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear prior picks")?;

        let now = now_iso();
        for (idx, candidate_id) in candidate_ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO picks(id, cycle_id, user_id, candidate_id, rank, picked_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(new_id("pk"))
            .bind(cycle_id)
            .bind(user_id)
            .bind(candidate_id)
            .bind((idx + 1) as i64)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert pick")?;
        }

        tx.commit().await.context("commit replace_picks")?;
        self.list_user_picks(cycle_id, user_id).await
    }

    async fn list_user_picks(&self, cycle_id: &str, user_id: &str) -> MarketResult<Vec<Pick>> {
        let rows: Vec<PickRow> = sqlx::query_as(
            "SELECT * FROM picks WHERE cycle_id = ? AND user_id = ? ORDER BY rank ASC",
        )
        .bind(cycle_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list user picks")?;
        Ok(rows.into_iter().map(PickRow::into_pick).collect())
    }

    async fn list_picks(&self, cycle_id: &str) -> MarketResult<Vec<Pick>> {
        let rows: Vec<PickRow> = sqlx::query_as(
            "SELECT * FROM picks WHERE cycle_id = ? ORDER BY picked_at ASC, rank ASC",
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list picks")?;
        Ok(rows.into_iter().map(PickRow::into_pick).collect())
    }

    async fn commit_settlement(
        &self,
        cycle_id: &str,
        results: &[(String, bool)],
        credits: &[SettlementCredit],
    ) -> MarketResult<()> {
        let mut tx = self.pool.begin().await.context("begin commit_settlement")?;

        // The status flip is the single-writer gate: exactly one settlement
        // attempt can move the row out of OPEN.
        let flipped = sqlx::query(
            "UPDATE cycles SET status = 'SETTLED', closed_at = ? WHERE id = ? AND status = 'OPEN'",
        )
        .bind(now_iso())
        .bind(cycle_id)
        .execute(&mut *tx)
        .await
        .context("Failed to flip cycle status")?
        .rows_affected();
        if flipped == 0 {
            drop(tx);
            self.get_cycle(cycle_id).await?;
            return Err(MarketError::AlreadySettled {
                cycle_id: cycle_id.to_string(),
            });
        }

        sqlx::query("DELETE FROM cycle_results WHERE cycle_id = ?")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear cycle results")?;
        for (candidate_id, is_winner) in results {
            sqlx::query(
                "INSERT INTO cycle_results(cycle_id, candidate_id, is_winner) VALUES (?, ?, ?)",
            )
            .bind(cycle_id)
            .bind(candidate_id)
            .bind(if *is_winner { 1i64 } else { 0i64 })
            .execute(&mut *tx)
            .await
            .context("Failed to insert cycle result")?;
        }

        let now = now_iso();
        for credit in credits {
            sqlx::query("UPDATE users SET current_chips = current_chips + ? WHERE id = ?")
                .bind(credit.chips)
                .bind(&credit.user_id)
                .execute(&mut *tx)
                .await
                .context("Failed to update cached balance at settlement")?;
            sqlx::query(
                r#"
                INSERT INTO chip_ledger(id, user_id, cycle_id, event_type, chips_delta, metadata, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(new_id("led"))
            .bind(&credit.user_id)
            .bind(cycle_id)
            .bind(EventType::PickReward.as_str())
            .bind(credit.chips)
            .bind(serde_json::json!({"correct_picks": credit.correct_picks}).to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Failed to append pick reward ledger entry")?;
        }

        tx.commit().await.context("commit settlement")?;
        info!(
            "Settled cycle {} with {} reward credits",
            cycle_id,
            credits.len()
        );
        Ok(())
    }

    async fn list_winner_candidate_ids(&self, cycle_id: &str) -> MarketResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT candidate_id FROM cycle_results WHERE cycle_id = ? AND is_winner = 1",
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list winner candidates")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn record_click(
        &self,
        candidate_id: &str,
        fingerprint_source: &str,
        clicked_by_user_id: Option<&str>,
    ) -> MarketResult<ClickOutcome> {
        let candidate: Option<(String, String)> = sqlx::query_as(
            "SELECT cycle_id, submitted_by_user_id FROM candidate_links WHERE id = ?",
        )
        .bind(candidate_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch candidate for click")?;
        let (cycle_id, submitter) = match candidate {
            Some(pair) => pair,
            None => {
                return Err(MarketError::NotFound {
                    entity: "candidate",
                    id: candidate_id.to_string(),
                })
            }
        };

        if clicked_by_user_id == Some(submitter.as_str()) {
            return Ok(ClickOutcome::SelfClick);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO click_events(id, cycle_id, candidate_id, clicked_by_user_id, fingerprint_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new_id("clk"))
        .bind(&cycle_id)
        .bind(candidate_id)
        .bind(clicked_by_user_id)
        .bind(fingerprint_hash(fingerprint_source))
        .bind(now_iso())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(ClickOutcome::Counted),
            Err(err) if is_unique_violation(&err) => Ok(ClickOutcome::Duplicate),
            Err(err) => Err(MarketError::Storage(
                anyhow::Error::from(err).context("Failed to record click"),
            )),
        }
    }

    async fn has_curation_rewards(&self, cycle_id: &str) -> MarketResult<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM curation_rewards WHERE cycle_id = ?")
                .bind(cycle_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count curation rewards")?;
        Ok(count.0 > 0)
    }

    async fn curation_click_totals(&self, cycle_id: &str) -> MarketResult<Vec<SubmitterClicks>> {
        let rows: Vec<SubmitterClicksRow> = sqlx::query_as(
            r#"
            SELECT c.submitted_by_user_id AS user_id,
                   COUNT(e.id) AS unique_clicks,
                   MIN(c.created_at) AS first_submitted_at
            FROM candidate_links c
            LEFT JOIN click_events e ON e.candidate_id = c.id
            WHERE c.cycle_id = ?
            GROUP BY c.submitted_by_user_id
            HAVING COUNT(e.id) > 0
            ORDER BY unique_clicks DESC, first_submitted_at ASC, user_id ASC
            "#,
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate unique clicks")?;
        Ok(rows
            .into_iter()
            .map(|row| SubmitterClicks {
                user_id: row.user_id,
                unique_clicks: row.unique_clicks,
                first_submitted_at: row.first_submitted_at,
            })
            .collect())
    }

    async fn insert_curation_rewards(
        &self,
        cycle_id: &str,
        rows: &[CurationReward],
    ) -> MarketResult<bool> {
        let mut tx = self.pool.begin().await.context("begin curation rewards")?;
        let now = now_iso();

        for row in rows {
            let inserted = sqlx::query(
                r#"
                INSERT INTO curation_rewards(cycle_id, user_id, rank, unique_clicks, reward_chips, awarded_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(cycle_id)
            .bind(&row.user_id)
            .bind(row.rank as i64)
            .bind(row.unique_clicks)
            .bind(row.reward_chips)
            .bind(&now)
            .execute(&mut *tx)
            .await;
            match inserted {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => {
                    // A concurrent run already awarded this cycle; the
                    // rollback keeps every user at exactly one reward.
                    return Ok(false);
                }
                Err(err) => {
                    return Err(MarketError::Storage(
                        anyhow::Error::from(err).context("Failed to insert curation reward"),
                    ))
                }
            }

            sqlx::query("UPDATE users SET current_chips = current_chips + ? WHERE id = ?")
                .bind(row.reward_chips)
                .bind(&row.user_id)
                .execute(&mut *tx)
                .await
                .context("Failed to update cached balance for curation reward")?;
            sqlx::query(
                r#"
                INSERT INTO chip_ledger(id, user_id, cycle_id, event_type, chips_delta, metadata, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(new_id("led"))
            .bind(&row.user_id)
            .bind(cycle_id)
            .bind(EventType::CurationReward.as_str())
            .bind(row.reward_chips)
            .bind(
                serde_json::json!({"rank": row.rank, "unique_clicks": row.unique_clicks})
                    .to_string(),
            )
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Failed to append curation reward ledger entry")?;
        }

        tx.commit().await.context("commit curation rewards")?;
        Ok(true)
    }

    async fn list_curation_rewards(&self, cycle_id: &str) -> MarketResult<Vec<CurationReward>> {
        let rows: Vec<CurationRewardRow> = sqlx::query_as(
            r#"
            SELECT cycle_id, user_id, rank, unique_clicks, reward_chips
            FROM curation_rewards
            WHERE cycle_id = ?
            ORDER BY rank ASC, user_id ASC
            "#,
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list curation rewards")?;
        Ok(rows
            .into_iter()
            .map(|row| CurationReward {
                cycle_id: row.cycle_id,
                user_id: row.user_id,
                rank: row.rank as u32,
                unique_clicks: row.unique_clicks,
                reward_chips: row.reward_chips,
            })
            .collect())
    }

    async fn upsert_model_prediction(&self, prediction: &ModelPrediction) -> MarketResult<()> {
        sqlx::query(
            r#"
            INSERT INTO model_predictions(cycle_id, model_user_id, candidate_id, probability, explanation, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(cycle_id, model_user_id, candidate_id)
            DO UPDATE SET probability = excluded.probability,
                          explanation = excluded.explanation,
                          created_at = excluded.created_at
            "#,
        )
        .bind(&prediction.cycle_id)
        .bind(&prediction.model_user_id)
        .bind(&prediction.candidate_id)
        .bind(prediction.probability)
        .bind(&prediction.explanation)
        .bind(now_iso())
        .execute(&self.pool)
        .await
        .context("Failed to upsert model prediction")?;
        Ok(())
    }

    async fn list_model_predictions(
        &self,
        cycle_id: &str,
        model_user_id: Option<&str>,
    ) -> MarketResult<Vec<ModelPrediction>> {
        let rows: Vec<PredictionRow> = match model_user_id {
            Some(model_user_id) => sqlx::query_as(
                r#"
                SELECT cycle_id, model_user_id, candidate_id, probability, explanation
                FROM model_predictions
                WHERE cycle_id = ? AND model_user_id = ?
                ORDER BY probability DESC
                "#,
            )
            .bind(cycle_id)
            .bind(model_user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list model predictions")?,
            None => sqlx::query_as(
                r#"
                SELECT cycle_id, model_user_id, candidate_id, probability, explanation
                FROM model_predictions
                WHERE cycle_id = ?
                ORDER BY probability DESC
                "#,
            )
            .bind(cycle_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list model predictions")?,
        };
        Ok(rows
            .into_iter()
            .map(|row| ModelPrediction {
                cycle_id: row.cycle_id,
                model_user_id: row.model_user_id,
                candidate_id: row.candidate_id,
                probability: row.probability,
                explanation: row.explanation,
            })
            .collect())
    }

    async fn upsert_archive_link(
        &self,
        post_date: &str,
        url: &str,
        title: &str,
        source_post_url: &str,
    ) -> MarketResult<()> {
        let canonical = canonicalize_url(url)?;
        let domain = extract_domain(&canonical);
        sqlx::query(
            r#"
            INSERT INTO archive_links(id, post_date, url, canonical_url, domain, title, source_post_url, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(post_date, canonical_url)
            DO UPDATE SET title = excluded.title, source_post_url = excluded.source_post_url
            "#,
        )
        .bind(new_id("arc"))
        .bind(post_date)
        .bind(url)
        .bind(&canonical)
        .bind(&domain)
        .bind(title)
        .bind(source_post_url)
        .bind(now_iso())
        .execute(&self.pool)
        .await
        .context("Failed to upsert archive link")?;
        Ok(())
    }

    async fn source_post_seen(&self, source_post_url: &str) -> MarketResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM source_posts WHERE source_post_url = ?")
                .bind(source_post_url)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to check source post")?;
        Ok(row.is_some())
    }

    async fn mark_source_post_processed(
        &self,
        source_post_url: &str,
        title: &str,
        published_at: &str,
        extracted_links: &[String],
    ) -> MarketResult<()> {
        let now = now_iso();
        sqlx::query(
            r#"
            INSERT INTO source_posts(id, source_post_url, title, published_at, extracted_links_json, processed_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_post_url)
            DO UPDATE SET title = excluded.title,
                          published_at = excluded.published_at,
                          extracted_links_json = excluded.extracted_links_json,
                          processed_at = excluded.processed_at
            "#,
        )
        .bind(new_id("src"))
        .bind(source_post_url)
        .bind(title)
        .bind(published_at)
        .bind(serde_json::to_string(extracted_links).context("serialize extracted links")?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to mark source post processed")?;
        Ok(())
    }

    async fn claim_job_run(
        &self,
        job_name: &str,
        run_key: &str,
        details: serde_json::Value,
    ) -> MarketResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_runs(id, job_name, run_key, status, details_json, created_at)
            VALUES (?, ?, ?, 'DONE', ?, ?)
            "#,
        )
        .bind(new_id("job"))
        .bind(job_name)
        .bind(run_key)
        .bind(details.to_string())
        .bind(now_iso())
        .execute(&self.pool)
        .await;
        match inserted {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(MarketError::Storage(
                anyhow::Error::from(err).context("Failed to claim job run"),
            )),
        }
    }

    async fn health_check(&self) -> MarketResult<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}
