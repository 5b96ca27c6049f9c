use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by pipeline stages.
///
/// The first five variants are recoverable: a stage folds them into its run
/// summary as warnings and keeps going. Everything else aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Insufficient data for {ticker}: need {needed} observations, have {available}")]
    DataInsufficiency {
        ticker: String,
        needed: usize,
        available: usize,
    },

    #[error("Stale artifact for {ticker}: {reason}")]
    StaleArtifact { ticker: String, reason: String },

    #[error("Training failed for {key}: {reason}")]
    TrainingFailure { key: String, reason: String },

    #[error("Outcome pending for prediction {prediction_id}")]
    OutcomePending { prediction_id: String },

    #[error("Retrain signal {signal_id} is held by another claimant")]
    SignalClaimConflict { signal_id: i64 },

    #[error("Registry inconsistency for {key}: {detail} (records: {records:?})")]
    RegistryInconsistency {
        key: String,
        detail: String,
        records: Vec<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        self.warning_kind().is_none()
    }

    pub fn warning_kind(&self) -> Option<WarningKind> {
        match self {
            PipelineError::DataInsufficiency { .. } => Some(WarningKind::DataInsufficiency),
            PipelineError::StaleArtifact { .. } => Some(WarningKind::StaleArtifact),
            PipelineError::TrainingFailure { .. } => Some(WarningKind::TrainingFailure),
            PipelineError::OutcomePending { .. } => Some(WarningKind::OutcomePending),
            PipelineError::SignalClaimConflict { .. } => Some(WarningKind::SignalClaimConflict),
            _ => None,
        }
    }
}

impl From<::config::ConfigError> for PipelineError {
    fn from(e: ::config::ConfigError) -> Self {
        PipelineError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    DataInsufficiency,
    StaleArtifact,
    TrainingFailure,
    OutcomePending,
    SignalClaimConflict,
    DeadlineExceeded,
}

/// A recoverable problem recorded in a run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    pub kind: WarningKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    pub message: String,
}

impl RunWarning {
    pub fn new(kind: WarningKind, ticker: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            ticker: ticker.map(str::to_string),
            message: message.into(),
        }
    }

    /// Wraps a recoverable error; returns the error back if it is fatal
    pub fn from_error(ticker: Option<&str>, err: PipelineError) -> std::result::Result<Self, PipelineError> {
        match err.warning_kind() {
            Some(kind) => Ok(Self::new(kind, ticker, err.to_string())),
            None => Err(err),
        }
    }

    pub fn deadline(stage: &str, unfinished: usize) -> Self {
        Self::new(
            WarningKind::DeadlineExceeded,
            None,
            format!("{} stage hit the cycle deadline with {} unfinished", stage, unfinished),
        )
    }
}
