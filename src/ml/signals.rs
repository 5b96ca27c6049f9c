use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::{format_date, format_ts, parse_date, parse_opt_ts, parse_ts};
use crate::error::{PipelineError, Result};
use crate::types::{NewRetrainSignal, RetrainSignal};

/// A held claim on one retrain signal
#[derive(Debug, Clone, Serialize)]
pub struct SignalClaim {
    pub signal: RetrainSignal,
    pub token: String,
    pub claimed_at: DateTime<Utc>,
}

const SIGNAL_COLUMNS: &str = "id, ticker, reason, confidence, window_start, window_end, created_at, processed_at, claim_token, claimed_at, completed_at";

/// Work queue of retrain requests with claim tokens and crash recovery
pub struct SignalQueue {
    pool: SqlitePool,
}

impl SignalQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue unless the ticker already has an open signal or one for the same window end
    pub async fn emit(&self, signal: &NewRetrainSignal, now: DateTime<Utc>) -> Result<Option<i64>> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO retrain_signals
                (ticker, reason, confidence, window_start, window_end, created_at)
            SELECT ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM retrain_signals WHERE ticker = ? AND completed_at IS NULL
            )
            "#,
        )
        .bind(&signal.ticker)
        .bind(&signal.reason)
        .bind(signal.confidence)
        .bind(format_date(signal.window_start))
        .bind(format_date(signal.window_end))
        .bind(format_ts(now))
        .bind(&signal.ticker)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Retrain signal for {} suppressed (open or duplicate)", signal.ticker);
            return Ok(None);
        }
        let id = result.last_insert_rowid();
        info!(
            "Retrain signal {} for {} (confidence {:.2}): {}",
            id, signal.ticker, signal.confidence, signal.reason
        );
        Ok(Some(id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<RetrainSignal>> {
        let row = sqlx::query(&format!("SELECT {} FROM retrain_signals WHERE id = ?", SIGNAL_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_signal).transpose()
    }

    /// Claimable signals: never claimed, or claimed but not completed within `claim_timeout`.
    /// Ordered by confidence desc, then age asc.
    pub async fn claimable(&self, now: DateTime<Utc>, claim_timeout: Duration) -> Result<Vec<RetrainSignal>> {
        let stale_before = format_ts(now - claim_timeout);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM retrain_signals
            WHERE completed_at IS NULL AND (claim_token IS NULL OR claimed_at < ?)
            ORDER BY confidence DESC, created_at ASC, id ASC
            "#,
            SIGNAL_COLUMNS
        ))
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_signal).collect()
    }

    /// Atomically take a signal. Fails with `SignalClaimConflict` if someone else holds it.
    pub async fn claim(&self, id: i64, now: DateTime<Utc>, claim_timeout: Duration) -> Result<SignalClaim> {
        let token = Uuid::new_v4().to_string();
        let now_ts = format_ts(now);
        let stale_before = format_ts(now - claim_timeout);

        let result = sqlx::query(
            r#"
            UPDATE retrain_signals
            SET processed_at = COALESCE(processed_at, ?), claim_token = ?, claimed_at = ?
            WHERE id = ? AND completed_at IS NULL AND (claim_token IS NULL OR claimed_at < ?)
            "#,
        )
        .bind(&now_ts)
        .bind(&token)
        .bind(&now_ts)
        .bind(id)
        .bind(&stale_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(PipelineError::SignalClaimConflict { signal_id: id });
        }

        let signal = self
            .get(id)
            .await?
            .ok_or(PipelineError::SignalClaimConflict { signal_id: id })?;
        debug!("Claimed retrain signal {} for {}", id, signal.ticker);
        Ok(SignalClaim {
            signal,
            token,
            claimed_at: now,
        })
    }

    /// Acknowledge a claim. Fails if the claim was taken over after a timeout.
    pub async fn complete(&self, claim: &SignalClaim, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE retrain_signals SET completed_at = ? WHERE id = ? AND claim_token = ? AND completed_at IS NULL",
        )
        .bind(format_ts(now))
        .bind(claim.signal.id)
        .bind(&claim.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(PipelineError::SignalClaimConflict {
                signal_id: claim.signal.id,
            });
        }
        Ok(())
    }

    pub async fn open(&self) -> Result<Vec<RetrainSignal>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM retrain_signals WHERE completed_at IS NULL ORDER BY confidence DESC, created_at ASC",
            SIGNAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_signal).collect()
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<RetrainSignal>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM retrain_signals ORDER BY created_at DESC, id DESC LIMIT ?",
            SIGNAL_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_signal).collect()
    }
}

/// Tickers in retrain priority order (confidence desc, age asc), de-duplicated
pub fn prioritized_tickers(signals: &[RetrainSignal]) -> Vec<String> {
    let mut ordered: Vec<&RetrainSignal> = signals.iter().collect();
    ordered.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    let mut tickers: Vec<String> = Vec::with_capacity(ordered.len());
    for s in ordered {
        if !tickers.contains(&s.ticker) {
            tickers.push(s.ticker.clone());
        }
    }
    tickers
}

fn row_to_signal(row: &SqliteRow) -> Result<RetrainSignal> {
    let window_start: String = row.try_get("window_start")?;
    let window_end: String = row.try_get("window_end")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(RetrainSignal {
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        reason: row.try_get("reason")?,
        confidence: row.try_get("confidence")?,
        window_start: parse_date(&window_start)?,
        window_end: parse_date(&window_end)?,
        created_at: parse_ts(&created_at)?,
        processed_at: parse_opt_ts(row.try_get("processed_at")?)?,
        claim_token: row.try_get("claim_token")?,
        claimed_at: parse_opt_ts(row.try_get("claimed_at")?)?,
        completed_at: parse_opt_ts(row.try_get("completed_at")?)?,
    })
}
