use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::database::{format_ts, parse_opt_ts, parse_ts};
use crate::error::{PipelineError, Result, RunWarning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FeatureBuild,
    Training,
    Prediction,
    Validation,
    Feedback,
    Cycle,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FeatureBuild => "feature_build",
            Stage::Training => "training",
            Stage::Prediction => "prediction",
            Stage::Validation => "validation",
            Stage::Feedback => "feedback",
            Stage::Cycle => "cycle",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "feature_build" => Ok(Stage::FeatureBuild),
            "training" => Ok(Stage::Training),
            "prediction" => Ok(Stage::Prediction),
            "validation" => Ok(Stage::Validation),
            "feedback" => Ok(Stage::Feedback),
            "cycle" => Ok(Stage::Cycle),
            _ => Err(PipelineError::Corrupt(format!("unknown stage: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    /// Finished with warnings
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunStatus::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "PARTIAL" => Ok(RunStatus::Partial),
            "FAILED" => Ok(RunStatus::Failed),
            _ => Err(PipelineError::Corrupt(format!("unknown run status: {}", s))),
        }
    }
}

/// What a stage entry point returns and what the run ledger stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub stage: Stage,
    pub config_version: i64,
    pub status: RunStatus,
    pub counts: BTreeMap<String, i64>,
    pub metrics: BTreeMap<String, f64>,
    pub warnings: Vec<RunWarning>,
    pub error: Option<String>,
    /// Stage-specific report
    #[serde(default)]
    pub detail: serde_json::Value,
    /// Child stage summaries of a cycle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<RunSummary>,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, stage: Stage, config_version: i64) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            config_version,
            status: RunStatus::Running,
            counts: BTreeMap::new(),
            metrics: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
            detail: serde_json::Value::Null,
            stages: Vec::new(),
        }
    }

    pub fn count(&mut self, name: &str, value: usize) -> &mut Self {
        self.counts.insert(name.to_string(), value as i64);
        self
    }

    pub fn metric(&mut self, name: &str, value: Option<f64>) -> &mut Self {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.metrics.insert(name.to_string(), v);
        }
        self
    }

    /// SUCCESS, or PARTIAL when any warning was recorded
    pub fn settle(&mut self) {
        self.status = if self.warnings.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Partial
        };
    }

    pub fn fail(&mut self, err: &PipelineError) {
        self.status = RunStatus::Failed;
        self.error = Some(err.to_string());
    }
}

/// One row of the run ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub stage: Stage,
    pub config_version: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
}

const RUN_COLUMNS: &str = "id, stage, config_version, status, started_at, finished_at, summary, error";

pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a RUNNING ledger entry and return its id
    pub async fn start(&self, stage: Stage, config_version: i64, now: DateTime<Utc>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO pipeline_runs (id, stage, config_version, status, started_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(stage.as_str())
        .bind(config_version)
        .bind(RunStatus::Running.as_str())
        .bind(format_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn finish(&self, summary: &RunSummary, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE pipeline_runs SET status = ?, finished_at = ?, summary = ?, error = ? WHERE id = ?")
            .bind(summary.status.as_str())
            .bind(format_ts(now))
            .bind(serde_json::to_string(summary)?)
            .bind(&summary.error)
            .bind(&summary.run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM pipeline_runs WHERE id = ?", RUN_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    pub async fn latest(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs ORDER BY started_at DESC, id LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }

    /// Most recent run of `stage` that finished without failing
    pub async fn last_completed(&self, stage: Stage) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM pipeline_runs
            WHERE stage = ? AND status IN ('SUCCESS', 'PARTIAL')
            ORDER BY started_at DESC LIMIT 1
            "#,
            RUN_COLUMNS
        ))
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_run).transpose()
    }
}

fn row_to_run(row: &SqliteRow) -> Result<RunRecord> {
    let stage: String = row.try_get("stage")?;
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let summary: Option<String> = row.try_get("summary")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        stage: stage.parse()?,
        config_version: row.try_get("config_version")?,
        status: status.parse()?,
        started_at: parse_ts(&started_at)?,
        finished_at: parse_opt_ts(row.try_get("finished_at")?)?,
        summary: summary.as_deref().map(serde_json::from_str::<RunSummary>).transpose()?,
        error: row.try_get("error")?,
    })
}
