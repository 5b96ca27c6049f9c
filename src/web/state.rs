use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{ConfigRepository, ConfigSnapshot, Settings};
use crate::database::Database;
use crate::error::Result;
use crate::feedback::{AccuracyRepository, AccuracyTally, FeedbackRepository};
use crate::ml::{ModelRegistry, SignalQueue};
use crate::pipeline::{RunRecord, RunRepository};
use crate::prediction::PredictionRepository;
use crate::types::{FeedbackMetric, Insight, ModelVersionRecord, Prediction, RetrainSignal};

const STATUS_RUNS: i64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct AccuracyDigest {
    pub since: NaiveDate,
    pub correct: i64,
    pub total: i64,
    pub accuracy: Option<f64>,
    pub by_ticker: Vec<TickerAccuracy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickerAccuracy {
    pub ticker: String,
    pub correct: i64,
    pub total: i64,
    pub accuracy: Option<f64>,
}

impl From<(String, AccuracyTally)> for TickerAccuracy {
    fn from((ticker, tally): (String, AccuracyTally)) -> Self {
        Self {
            ticker,
            correct: tally.correct,
            total: tally.total,
            accuracy: tally.accuracy(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub snapshot: ConfigSnapshot,
    pub runs: Vec<RunRecord>,
    pub promoted_models: Vec<ModelVersionRecord>,
    pub open_signals: Vec<RetrainSignal>,
    pub accuracy: AccuracyDigest,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackView {
    pub since: NaiveDate,
    pub metrics: Vec<FeedbackMetric>,
    pub insights: Vec<Insight>,
    pub accuracy: AccuracyDigest,
    pub open_signals: Vec<RetrainSignal>,
}

/// Read-only handles shared by the HTTP handlers and the `status` command
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub runs: Arc<RunRepository>,
    pub predictions: Arc<PredictionRepository>,
    pub accuracy: Arc<AccuracyRepository>,
    pub feedback: Arc<FeedbackRepository>,
    pub signals: Arc<SignalQueue>,
    pub configs: Arc<ConfigRepository>,
    pub registry: Arc<ModelRegistry>,
}

impl AppState {
    pub fn new(db: &Database, settings: Settings) -> Self {
        let pool = db.pool().clone();
        Self {
            runs: Arc::new(RunRepository::new(pool.clone())),
            predictions: Arc::new(PredictionRepository::new(pool.clone())),
            accuracy: Arc::new(AccuracyRepository::new(pool.clone())),
            feedback: Arc::new(FeedbackRepository::new(pool.clone())),
            signals: Arc::new(SignalQueue::new(pool.clone())),
            configs: Arc::new(ConfigRepository::new(pool.clone())),
            registry: Arc::new(ModelRegistry::new(pool, settings.paths.models_dir.clone())),
            settings: Arc::new(settings),
        }
    }

    async fn accuracy_digest(&self, since: NaiveDate, until: NaiveDate) -> Result<AccuracyDigest> {
        let tally = self.accuracy.tally_between(since, until).await?;
        let by_ticker = self.accuracy.tally_by_ticker(since, until).await?;
        Ok(AccuracyDigest {
            since,
            correct: tally.correct,
            total: tally.total,
            accuracy: tally.accuracy(),
            by_ticker: by_ticker.into_iter().map(TickerAccuracy::from).collect(),
        })
    }

    pub async fn status(&self, today: NaiveDate) -> Result<StatusView> {
        let since = today - Duration::days(self.settings.validation.rolling_window_days);
        Ok(StatusView {
            snapshot: self.configs.latest().await?,
            runs: self.runs.latest(STATUS_RUNS).await?,
            promoted_models: self.registry.all_promoted().await?,
            open_signals: self.signals.open().await?,
            accuracy: self.accuracy_digest(since, today).await?,
        })
    }

    pub async fn feedback_view(&self, today: NaiveDate, days: i64) -> Result<FeedbackView> {
        let since = today - Duration::days(days.max(0));
        Ok(FeedbackView {
            since,
            metrics: self.feedback.metrics_since(since).await?,
            insights: self.feedback.insights_since(since).await?,
            accuracy: self.accuracy_digest(since, today).await?,
            open_signals: self.signals.open().await?,
        })
    }

    pub async fn predictions(&self, ticker: Option<&str>, min_confidence: f64, limit: i64) -> Result<Vec<Prediction>> {
        self.predictions.recent(ticker, min_confidence, limit).await
    }
}
