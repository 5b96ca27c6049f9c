use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{ContextDocument, Diagnostics, ModelMetrics};
use crate::error::PipelineError;

/// Realized or predicted next-move direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Flat moves count as UP
    pub fn from_move(pct_move: f64) -> Self {
        if pct_move >= 0.0 {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Direction::Up)
    }
}

impl FromStr for Direction {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            _ => Err(PipelineError::Corrupt(format!("unknown direction: {}", s))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model kind: a single estimator or the weighted ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Logistic,
    Ensemble,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Logistic => "logistic",
            ModelKind::Ensemble => "ensemble",
        }
    }
}

impl FromStr for ModelKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logistic" => Ok(ModelKind::Logistic),
            "ensemble" => Ok(ModelKind::Ensemble),
            _ => Err(PipelineError::Corrupt(format!("unknown model kind: {}", s))),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-shape feature tensor metadata for (ticker, as-of, feature version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWindow {
    pub id: String,
    pub ticker: String,
    pub as_of: NaiveDate,
    pub sequence_length: usize,
    pub feature_count: usize,
    pub feature_version: String,
    pub payload_ref: String,
    pub context: ContextDocument,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Promotion is exclusive per (kind, feature version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromotionKey {
    pub kind: ModelKind,
    pub feature_version: String,
}

impl PromotionKey {
    pub fn new(kind: ModelKind, feature_version: impl Into<String>) -> Self {
        Self {
            kind,
            feature_version: feature_version.into(),
        }
    }
}

impl fmt::Display for PromotionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.feature_version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersionRecord {
    pub id: String,
    pub kind: ModelKind,
    pub training_range: TrainingRange,
    pub feature_version: String,
    pub metrics: ModelMetrics,
    pub artifact_ref: String,
    pub created_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
}

impl ModelVersionRecord {
    pub fn key(&self) -> PromotionKey {
        PromotionKey::new(self.kind, self.feature_version.clone())
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub ticker: String,
    pub as_of: NaiveDate,
    pub model_id: String,
    pub label: Direction,
    pub probability: f64,
    pub confidence: f64,
    /// Disagreement between sub-models, 0 = unanimous
    pub ensemble_score: f64,
    pub input_ref: String,
    pub diagnostics: Diagnostics,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyRecord {
    pub prediction_id: String,
    pub ticker: String,
    pub prediction_date: NaiveDate,
    pub verification_date: NaiveDate,
    pub realized_direction: Direction,
    pub price_move: f64,
    pub is_correct: bool,
    pub validation_source: String,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainSignal {
    pub id: i64,
    pub ticker: String,
    pub reason: String,
    pub confidence: f64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub claim_token: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRetrainSignal {
    pub ticker: String,
    pub reason: String,
    pub confidence: f64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricStatus {
    Excellent,
    Good,
    Fair,
    Critical,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Excellent => "EXCELLENT",
            MetricStatus::Good => "GOOD",
            MetricStatus::Fair => "FAIR",
            MetricStatus::Critical => "CRITICAL",
        }
    }
}

impl FromStr for MetricStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXCELLENT" => Ok(MetricStatus::Excellent),
            "GOOD" => Ok(MetricStatus::Good),
            "FAIR" => Ok(MetricStatus::Fair),
            "CRITICAL" => Ok(MetricStatus::Critical),
            _ => Err(PipelineError::Corrupt(format!("unknown metric status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMetric {
    pub as_of: NaiveDate,
    pub metric_name: String,
    pub value: f64,
    pub status: MetricStatus,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub as_of: NaiveDate,
    /// `global` or a ticker
    pub scope: String,
    pub category: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
