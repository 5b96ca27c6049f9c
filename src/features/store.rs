use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::database::{format_date, format_ts, parse_date, parse_ts};
use crate::error::{PipelineError, Result};
use crate::types::FeatureWindow;

/// Feature tensor payload: one row per session, one column per indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTensor {
    pub columns: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureTensor {
    pub fn sequence_length(&self) -> usize {
        self.rows.len()
    }

    pub fn feature_count(&self) -> usize {
        self.columns.len()
    }

    pub fn last_row(&self) -> Option<&[f64]> {
        self.rows.last().map(Vec::as_slice)
    }

    pub fn to_array(&self) -> Result<Array2<f64>> {
        let flat: Vec<f64> = self.rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((self.sequence_length(), self.feature_count()), flat)
            .map_err(|e| PipelineError::Corrupt(format!("feature tensor shape: {}", e)))
    }
}

/// Content-addressed feature windows: metadata rows in SQLite, tensors as JSON files
pub struct FeatureStore {
    pool: SqlitePool,
    payload_dir: PathBuf,
}

const WINDOW_COLUMNS: &str =
    "id, ticker, as_of, sequence_length, feature_count, feature_version, payload_ref, context, created_at";

impl FeatureStore {
    pub fn new(pool: SqlitePool, data_dir: impl AsRef<Path>) -> Self {
        Self {
            pool,
            payload_dir: data_dir.as_ref().join("features"),
        }
    }

    pub fn payload_path(&self, id: &str) -> PathBuf {
        self.payload_dir.join(format!("{}.json", id))
    }

    /// Insert-or-ignore. Returns true when the window was new.
    pub async fn put(&self, window: &FeatureWindow, tensor: &FeatureTensor) -> Result<bool> {
        let path = PathBuf::from(&window.payload_ref);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Write-then-rename so a crash never leaves a truncated payload
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec(tensor)?)?;
            std::fs::rename(&tmp, &path)?;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO feature_windows
                (id, ticker, as_of, sequence_length, feature_count, feature_version, payload_ref, context, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&window.id)
        .bind(&window.ticker)
        .bind(format_date(window.as_of))
        .bind(window.sequence_length as i64)
        .bind(window.feature_count as i64)
        .bind(&window.feature_version)
        .bind(&window.payload_ref)
        .bind(serde_json::to_string(&window.context)?)
        .bind(format_ts(window.created_at))
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!("Feature window {} for {} {}: inserted={}", window.id, window.ticker, window.as_of, inserted);
        Ok(inserted)
    }

    pub async fn get(&self, id: &str) -> Result<Option<FeatureWindow>> {
        let row = sqlx::query(&format!("SELECT {} FROM feature_windows WHERE id = ?", WINDOW_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_window).transpose()
    }

    /// Most recent window on or before `on_or_before`, preferring `preferred_version`
    pub async fn latest_for(
        &self,
        ticker: &str,
        on_or_before: NaiveDate,
        preferred_version: &str,
    ) -> Result<Option<FeatureWindow>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM feature_windows
            WHERE ticker = ? AND as_of <= ?
            ORDER BY (feature_version = ?) DESC, as_of DESC, created_at DESC
            LIMIT 1
            "#,
            WINDOW_COLUMNS
        ))
        .bind(ticker)
        .bind(format_date(on_or_before))
        .bind(preferred_version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_window).transpose()
    }

    /// All windows for a ticker under one feature version, oldest first
    pub async fn list_for(&self, ticker: &str, feature_version: &str) -> Result<Vec<FeatureWindow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM feature_windows WHERE ticker = ? AND feature_version = ? ORDER BY as_of ASC",
            WINDOW_COLUMNS
        ))
        .bind(ticker)
        .bind(feature_version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_window).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM feature_windows")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub fn load_payload(&self, window: &FeatureWindow) -> Result<FeatureTensor> {
        let bytes = std::fs::read(&window.payload_ref)?;
        let tensor: FeatureTensor = serde_json::from_slice(&bytes)?;
        if tensor.sequence_length() != window.sequence_length || tensor.feature_count() != window.feature_count {
            return Err(PipelineError::Corrupt(format!(
                "payload {} is {}x{}, window says {}x{}",
                window.payload_ref,
                tensor.sequence_length(),
                tensor.feature_count(),
                window.sequence_length,
                window.feature_count
            )));
        }
        Ok(tensor)
    }
}

fn row_to_window(row: &SqliteRow) -> Result<FeatureWindow> {
    let as_of: String = row.try_get("as_of")?;
    let context: String = row.try_get("context")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(FeatureWindow {
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        as_of: parse_date(&as_of)?,
        sequence_length: row.try_get::<i64, _>("sequence_length")? as usize,
        feature_count: row.try_get::<i64, _>("feature_count")? as usize,
        feature_version: row.try_get("feature_version")?,
        payload_ref: row.try_get("payload_ref")?,
        context: serde_json::from_str(&context)?,
        created_at: parse_ts(&created_at)?,
    })
}
