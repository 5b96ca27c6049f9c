pub mod market;

pub use market::*;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::{PipelineError, Result};

const SCHEMA: &[&str] = &[
    // Canonical adjusted daily prices (written by the ingestion side)
    r#"
    CREATE TABLE IF NOT EXISTS market_prices (
        ticker TEXT NOT NULL,
        date TEXT NOT NULL,
        open TEXT NOT NULL,
        high TEXT NOT NULL,
        low TEXT NOT NULL,
        close TEXT NOT NULL,
        volume TEXT NOT NULL,
        PRIMARY KEY (ticker, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_sentiment (
        ticker TEXT NOT NULL,
        as_of TEXT NOT NULL,
        article_count INTEGER NOT NULL,
        avg_sentiment REAL NOT NULL,
        buzz_score REAL,
        volatility REAL,
        PRIMARY KEY (ticker, as_of)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feature_windows (
        id TEXT PRIMARY KEY,
        ticker TEXT NOT NULL,
        as_of TEXT NOT NULL,
        sequence_length INTEGER NOT NULL,
        feature_count INTEGER NOT NULL,
        feature_version TEXT NOT NULL,
        payload_ref TEXT NOT NULL,
        context TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_feature_windows_ticker ON feature_windows(ticker, feature_version, as_of)",
    r#"
    CREATE TABLE IF NOT EXISTS model_versions (
        id TEXT PRIMARY KEY,
        model_kind TEXT NOT NULL,
        training_start TEXT NOT NULL,
        training_end TEXT NOT NULL,
        feature_version TEXT NOT NULL,
        metrics TEXT NOT NULL,
        artifact_ref TEXT NOT NULL,
        created_at TEXT NOT NULL,
        promoted_at TEXT
    )
    "#,
    // At most one promoted version per (kind, feature version)
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_model_versions_promoted
        ON model_versions(model_kind, feature_version) WHERE promoted_at IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS promotion_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_id TEXT NOT NULL,
        model_kind TEXT NOT NULL,
        feature_version TEXT NOT NULL,
        action TEXT NOT NULL,
        reason TEXT NOT NULL,
        at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS predictions (
        id TEXT PRIMARY KEY,
        ticker TEXT NOT NULL,
        as_of TEXT NOT NULL,
        model_id TEXT NOT NULL,
        label TEXT NOT NULL,
        probability REAL NOT NULL,
        confidence REAL NOT NULL,
        ensemble_score REAL NOT NULL,
        input_ref TEXT NOT NULL,
        diagnostics TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_predictions_ticker ON predictions(ticker, as_of)",
    "CREATE INDEX IF NOT EXISTS idx_predictions_as_of ON predictions(as_of)",
    r#"
    CREATE TABLE IF NOT EXISTS prediction_accuracy (
        prediction_id TEXT PRIMARY KEY,
        ticker TEXT NOT NULL,
        prediction_date TEXT NOT NULL,
        verification_date TEXT NOT NULL,
        realized_direction TEXT NOT NULL,
        price_move REAL NOT NULL,
        is_correct INTEGER NOT NULL,
        validation_source TEXT NOT NULL,
        validated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_accuracy_verification ON prediction_accuracy(verification_date)",
    r#"
    CREATE TABLE IF NOT EXISTS validation_exclusions (
        prediction_id TEXT PRIMARY KEY,
        reason TEXT NOT NULL,
        excluded_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feedback_metrics (
        as_of TEXT NOT NULL,
        metric_name TEXT NOT NULL,
        value REAL NOT NULL,
        status TEXT NOT NULL,
        details TEXT NOT NULL,
        PRIMARY KEY (as_of, metric_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS insights (
        as_of TEXT NOT NULL,
        scope TEXT NOT NULL,
        category TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (as_of, scope, category)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS retrain_signals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ticker TEXT NOT NULL,
        reason TEXT NOT NULL,
        confidence REAL NOT NULL,
        window_start TEXT NOT NULL,
        window_end TEXT NOT NULL,
        created_at TEXT NOT NULL,
        processed_at TEXT,
        claim_token TEXT,
        claimed_at TEXT,
        completed_at TEXT,
        UNIQUE (ticker, window_end)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_retrain_signals_open ON retrain_signals(completed_at, ticker)",
    r#"
    CREATE TABLE IF NOT EXISTS config_snapshots (
        version INTEGER PRIMARY KEY,
        parent_version INTEGER,
        overrides TEXT NOT NULL,
        source TEXT NOT NULL UNIQUE,
        reason TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        id TEXT PRIMARY KEY,
        stage TEXT NOT NULL,
        config_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        summary TEXT,
        error TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_stage ON pipeline_runs(stage, started_at)",
];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database and bootstrap the schema
    pub async fn new(db_url: &str) -> Result<Self> {
        info!("Initializing SQLite database at: {}", db_url);

        if let Some(path_part) = db_url
            .strip_prefix("sqlite://")
            .or_else(|| db_url.strip_prefix("sqlite:"))
        {
            if let Some(parent) = Path::new(path_part).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Private in-memory database on a single long-lived connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    async fn create_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Fixed-width RFC3339 so stored timestamps order lexicographically
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}

pub fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| PipelineError::Corrupt(format!("date {:?}: {}", raw, e)))
}
