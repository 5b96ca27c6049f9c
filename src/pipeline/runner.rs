use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::runs::{RunRepository, RunStatus, RunSummary, Stage};
use crate::config::{ConfigRepository, ConfigSnapshot, Settings};
use crate::database::{Database, MarketDataSource, SqliteMarketData};
use crate::error::{PipelineError, Result, RunWarning};
use crate::features::{canonical_ticker, FeatureBuilder, FeatureStore};
use crate::feedback::{AccuracyRepository, FeedbackEngine, FeedbackRepository, Validator};
use crate::ml::{ModelRegistry, PromotionDecision, SignalQueue, TrainingMode, TrainingOrchestrator};
use crate::prediction::{PredictionConfig, PredictionRepository, PredictionService};
use crate::types::{NewsSentiment, PriceBar};

/// Which tickers a stage runs over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickerSelection {
    /// Configured universe, or every ticker with prices when the universe is empty
    All,
    Only(Vec<String>),
}

/// What a stage hands back to the ledger
#[derive(Debug, Default)]
struct StageOutcome {
    counts: Vec<(&'static str, usize)>,
    metrics: Vec<(&'static str, Option<f64>)>,
    warnings: Vec<RunWarning>,
    detail: serde_json::Value,
}

impl StageOutcome {
    fn with_detail(detail: &impl Serialize) -> Result<Self> {
        Ok(Self {
            detail: serde_json::to_value(detail)?,
            ..Default::default()
        })
    }
}

/// Wires every component over one database and runs pipeline stages
pub struct Pipeline {
    settings: Settings,
    db: Database,
    market: Arc<SqliteMarketData>,
    store: Arc<FeatureStore>,
    registry: Arc<ModelRegistry>,
    signals: Arc<SignalQueue>,
    predictions: Arc<PredictionRepository>,
    accuracy: Arc<AccuracyRepository>,
    feedback: Arc<FeedbackRepository>,
    configs: Arc<ConfigRepository>,
    runs: Arc<RunRepository>,
}

impl Pipeline {
    pub async fn open(settings: Settings) -> Result<Self> {
        let db = Database::new(&settings.paths.database_url).await?;
        Ok(Self::with_database(settings, db))
    }

    pub fn with_database(settings: Settings, db: Database) -> Self {
        let pool = db.pool().clone();
        Self {
            market: Arc::new(SqliteMarketData::new(pool.clone())),
            store: Arc::new(FeatureStore::new(pool.clone(), &settings.paths.data_dir)),
            registry: Arc::new(ModelRegistry::new(pool.clone(), settings.paths.models_dir.clone())),
            signals: Arc::new(SignalQueue::new(pool.clone())),
            predictions: Arc::new(PredictionRepository::new(pool.clone())),
            accuracy: Arc::new(AccuracyRepository::new(pool.clone())),
            feedback: Arc::new(FeedbackRepository::new(pool.clone())),
            configs: Arc::new(ConfigRepository::new(pool.clone())),
            runs: Arc::new(RunRepository::new(pool)),
            settings,
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn import_prices(&self, bars: &[PriceBar]) -> Result<u64> {
        let bars: Vec<PriceBar> = bars
            .iter()
            .map(|b| PriceBar {
                ticker: canonical_ticker(&b.ticker),
                ..b.clone()
            })
            .collect();
        self.market.insert_bars(&bars).await
    }

    pub async fn import_sentiment(&self, rows: &[NewsSentiment]) -> Result<u64> {
        let rows: Vec<NewsSentiment> = rows
            .iter()
            .map(|r| NewsSentiment {
                ticker: canonical_ticker(&r.ticker),
                ..r.clone()
            })
            .collect();
        self.market.insert_sentiment(&rows).await
    }

    fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.settings.pipeline.cycle_deadline_secs)
    }

    async fn tickers(&self, selection: &TickerSelection) -> Result<Vec<String>> {
        let mut tickers = match selection {
            TickerSelection::Only(list) => list.iter().map(|t| canonical_ticker(t)).collect(),
            TickerSelection::All if !self.settings.pipeline.universe.is_empty() => self
                .settings
                .pipeline
                .universe
                .iter()
                .map(|t| canonical_ticker(t))
                .collect(),
            TickerSelection::All => self.market.tickers().await?,
        };
        tickers.sort();
        tickers.dedup();
        Ok(tickers)
    }

    /// Record a ledger entry around one stage. Fatal stage errors become a FAILED summary.
    async fn execute<Fut>(&self, stage: Stage, snapshot: &ConfigSnapshot, work: Fut) -> Result<RunSummary>
    where
        Fut: Future<Output = Result<StageOutcome>>,
    {
        let run_id = self.runs.start(stage, snapshot.version, Utc::now()).await?;
        let mut summary = RunSummary::new(run_id, stage, snapshot.version);
        info!("Starting {} run {} (config v{})", stage, summary.run_id, snapshot.version);

        match work.await {
            Ok(outcome) => {
                for (name, value) in outcome.counts {
                    summary.count(name, value);
                }
                for (name, value) in outcome.metrics {
                    summary.metric(name, value);
                }
                summary.warnings = outcome.warnings;
                summary.detail = outcome.detail;
                summary.settle();
                info!(
                    "{} run {} finished {} with {} warnings",
                    stage,
                    summary.run_id,
                    summary.status.as_str(),
                    summary.warnings.len()
                );
            }
            Err(err) => {
                error!("{} run {} failed: {}", stage, summary.run_id, err);
                summary.fail(&err);
            }
        }

        self.runs.finish(&summary, Utc::now()).await?;
        Ok(summary)
    }

    pub async fn run_feature_build(&self, selection: TickerSelection, as_of: NaiveDate) -> Result<RunSummary> {
        let snapshot = self.configs.latest().await?;
        self.feature_build(&snapshot, &selection, as_of, self.deadline()).await
    }

    async fn feature_build(
        &self,
        snapshot: &ConfigSnapshot,
        selection: &TickerSelection,
        as_of: NaiveDate,
        deadline: Instant,
    ) -> Result<RunSummary> {
        self.execute(Stage::FeatureBuild, snapshot, async {
            let tickers = self.tickers(selection).await?;
            let params = snapshot.feature_params(&self.settings.features);
            let builder = FeatureBuilder::new(self.market.clone(), self.store.clone(), self.settings.pipeline.max_workers);
            let report = builder.build(tickers, as_of, &params, snapshot.version, deadline).await?;

            let mut outcome = StageOutcome::with_detail(&report)?;
            outcome.counts = vec![
                ("tickers_requested", report.tickers_requested),
                ("tickers_processed", report.tickers_processed),
                ("windows_created", report.windows_created),
                ("windows_existing", report.windows_existing),
            ];
            outcome.warnings = report.warnings;
            Ok::<_, PipelineError>(outcome)
        })
        .await
    }

    pub async fn run_training(&self, mode: TrainingMode) -> Result<RunSummary> {
        let snapshot = self.configs.latest().await?;
        self.training(&snapshot, mode, self.deadline()).await
    }

    async fn training(&self, snapshot: &ConfigSnapshot, mode: TrainingMode, deadline: Instant) -> Result<RunSummary> {
        self.execute(Stage::Training, snapshot, async {
            let universe = self.tickers(&TickerSelection::All).await?;
            let feature_version = snapshot.feature_version(&self.settings);
            let orchestrator = TrainingOrchestrator::new(
                self.market.clone(),
                self.store.clone(),
                self.registry.clone(),
                self.signals.clone(),
                self.settings.training.clone(),
                self.settings.validation.horizon_sessions,
                self.settings.pipeline.max_workers,
            );
            let report = orchestrator
                .run(mode, &universe, &feature_version, Utc::now(), deadline)
                .await?;

            let promoted = report
                .candidates
                .iter()
                .filter(|c| matches!(c.decision, PromotionDecision::Promoted { .. }))
                .count();
            let best = report.candidates.iter().filter_map(|c| c.score).reduce(f64::max);

            let mut outcome = StageOutcome::with_detail(&report)?;
            outcome.counts = vec![
                ("signals_claimed", report.signals_claimed),
                ("signals_completed", report.signals_completed),
                ("tickers_used", report.tickers_used.len()),
                ("samples", report.samples),
                ("train_samples", report.train_samples),
                ("holdout_samples", report.holdout_samples),
                ("candidates", report.candidates.len()),
                ("promoted", promoted),
            ];
            outcome.metrics = vec![("best_candidate_score", best)];
            outcome.warnings = report.warnings;
            Ok::<_, PipelineError>(outcome)
        })
        .await
    }

    pub async fn run_prediction(&self, selection: TickerSelection, as_of: NaiveDate) -> Result<RunSummary> {
        let snapshot = self.configs.latest().await?;
        self.prediction(&snapshot, &selection, as_of, self.deadline()).await
    }

    async fn prediction(
        &self,
        snapshot: &ConfigSnapshot,
        selection: &TickerSelection,
        as_of: NaiveDate,
        deadline: Instant,
    ) -> Result<RunSummary> {
        self.execute(Stage::Prediction, snapshot, async {
            let tickers = self.tickers(selection).await?;
            let config = PredictionConfig::resolve(&self.settings, snapshot);
            let service = PredictionService::new(
                self.store.clone(),
                self.registry.clone(),
                self.predictions.clone(),
                self.settings.pipeline.max_workers,
            );
            let report = service.run(tickers, as_of, &config, deadline).await?;

            let mut outcome = StageOutcome::with_detail(&report)?;
            outcome.counts = vec![
                ("tickers_requested", report.tickers_requested),
                ("created", report.created),
                ("existing", report.existing),
            ];
            outcome.metrics = vec![("up_threshold", Some(config.up_threshold))];
            outcome.warnings = report.warnings;
            Ok::<_, PipelineError>(outcome)
        })
        .await
    }

    pub async fn run_validation(&self, horizon: Option<usize>, today: NaiveDate) -> Result<RunSummary> {
        let snapshot = self.configs.latest().await?;
        self.validation(&snapshot, horizon, today, self.deadline()).await
    }

    async fn validation(
        &self,
        snapshot: &ConfigSnapshot,
        horizon: Option<usize>,
        today: NaiveDate,
        deadline: Instant,
    ) -> Result<RunSummary> {
        self.execute(Stage::Validation, snapshot, async {
            let validator = Validator::new(
                self.market.clone(),
                self.predictions.clone(),
                self.accuracy.clone(),
                self.settings.validation.clone(),
            );
            let report = validator.run(today, horizon, Utc::now(), deadline).await?;

            let mut outcome = StageOutcome::with_detail(&report)?;
            outcome.counts = vec![
                ("candidates", report.candidates),
                ("validated", report.validated),
                ("correct", report.correct),
                ("pending", report.pending),
                ("unverifiable", report.unverifiable),
                ("already_validated", report.already_validated),
            ];
            outcome.metrics = vec![("rolling_accuracy", report.rolling_accuracy)];
            outcome.warnings = report.warnings;
            Ok::<_, PipelineError>(outcome)
        })
        .await
    }

    pub async fn run_feedback(&self, as_of: NaiveDate) -> Result<RunSummary> {
        let snapshot = self.configs.latest().await?;
        self.feedback_stage(&snapshot, as_of, self.deadline()).await
    }

    async fn feedback_stage(&self, snapshot: &ConfigSnapshot, as_of: NaiveDate, deadline: Instant) -> Result<RunSummary> {
        self.execute(Stage::Feedback, snapshot, async {
            let engine = FeedbackEngine::new(
                self.accuracy.clone(),
                self.feedback.clone(),
                self.signals.clone(),
                self.configs.clone(),
                self.settings.feedback.clone(),
            );
            let report = engine
                .run(as_of, snapshot, &self.settings.prediction, Utc::now(), deadline)
                .await?;

            let mut outcome = StageOutcome::with_detail(&report)?;
            outcome.counts = vec![
                ("reviewed", report.reviewed),
                ("metrics_written", report.metrics_written),
                ("insights_written", report.insights_written),
                ("signals_emitted", report.signals_emitted.len()),
            ];
            outcome.metrics = vec![
                ("accuracy", report.global.as_ref().map(|g| g.accuracy)),
                ("directional_bias", report.global.as_ref().map(|g| g.directional_bias)),
                ("calibration", report.global.as_ref().map(|g| g.calibration)),
                ("proposed_up_threshold", report.recommendation.as_ref().map(|r| r.proposed)),
            ];
            outcome.warnings = report.warnings;
            Ok::<_, PipelineError>(outcome)
        })
        .await
    }

    /// Full training when the interval elapsed, priority retraining when signals wait, else none
    async fn training_mode_for(&self, as_of: NaiveDate) -> Result<Option<TrainingMode>> {
        let due = match self.registry.latest_training_end().await? {
            None => true,
            Some(end) => (as_of - end).num_days() >= self.settings.pipeline.training_interval_days,
        };
        if due {
            return Ok(Some(TrainingMode::FullBatch));
        }
        let timeout = chrono::Duration::minutes(self.settings.training.claim_timeout_mins);
        if !self.signals.claimable(Utc::now(), timeout).await?.is_empty() {
            return Ok(Some(TrainingMode::PrioritySignals));
        }
        Ok(None)
    }

    /// build -> train (when due) -> predict -> validate -> feedback, on one snapshot and deadline
    pub async fn run_cycle(&self, as_of: NaiveDate) -> Result<RunSummary> {
        let snapshot = self.configs.latest().await?;
        let deadline = self.deadline();
        let run_id = self.runs.start(Stage::Cycle, snapshot.version, Utc::now()).await?;
        let mut cycle = RunSummary::new(run_id, Stage::Cycle, snapshot.version);
        info!("Cycle {} for {} on config v{}", cycle.run_id, as_of, snapshot.version);

        let all = TickerSelection::All;
        let mut stages = vec![self.feature_build(&snapshot, &all, as_of, deadline).await?];

        if !stages.iter().any(|s| s.status.is_failed()) {
            match self.training_mode_for(as_of).await? {
                Some(mode) => stages.push(self.training(&snapshot, mode, deadline).await?),
                None => info!("Training not due and no retrain signals pending"),
            }
        }
        if !stages.iter().any(|s| s.status.is_failed()) {
            stages.push(self.prediction(&snapshot, &all, as_of, deadline).await?);
        }
        if !stages.iter().any(|s| s.status.is_failed()) {
            stages.push(self.validation(&snapshot, None, as_of, deadline).await?);
        }
        if !stages.iter().any(|s| s.status.is_failed()) {
            stages.push(self.feedback_stage(&snapshot, as_of, deadline).await?);
        }

        for stage in &stages {
            for (name, value) in &stage.counts {
                cycle.counts.insert(format!("{}.{}", stage.stage, name), *value);
            }
            for (name, value) in &stage.metrics {
                cycle.metrics.insert(format!("{}.{}", stage.stage, name), *value);
            }
            cycle.warnings.extend(stage.warnings.iter().cloned());
        }

        match stages.iter().find(|s| s.status.is_failed()) {
            Some(failed) => {
                cycle.status = RunStatus::Failed;
                cycle.error = Some(format!(
                    "{} stage failed: {}",
                    failed.stage,
                    failed.error.as_deref().unwrap_or("unknown error")
                ));
                warn!("Cycle {} aborted after {} stage", cycle.run_id, failed.stage);
            }
            None => cycle.settle(),
        }
        cycle.stages = stages;

        self.runs.finish(&cycle, Utc::now()).await?;
        info!("Cycle {} finished {}", cycle.run_id, cycle.status.as_str());
        Ok(cycle)
    }
}
