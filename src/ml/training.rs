use chrono::{DateTime, Duration, NaiveDate, Utc};
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use super::signals::{prioritized_tickers, SignalClaim};
use super::{ModelArtifact, ModelRegistry, PromotionDecision, SignalQueue};
use crate::config::TrainingSettings;
use crate::database::MarketDataSource;
use crate::error::{PipelineError, Result, RunWarning, WarningKind};
use crate::features::FeatureStore;
use crate::pipeline::partition::for_each_ticker;
use crate::types::{ModelKind, ModelMetrics, PriceSeries, TrainingRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrainingMode {
    /// Only tickers named by claimed retrain signals
    PrioritySignals,
    /// Signalled tickers first, then the whole universe
    FullBatch,
}

/// One labelled training example: last row of a feature window and the realized direction
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub ticker: String,
    pub as_of: NaiveDate,
    pub features: Vec<f64>,
    pub up: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateReport {
    pub model_id: String,
    pub kind: ModelKind,
    pub score: Option<f64>,
    pub decision: PromotionDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub mode: TrainingMode,
    pub feature_version: String,
    pub signals_claimed: usize,
    pub signals_completed: usize,
    pub priority_tickers: Vec<String>,
    pub tickers_used: Vec<String>,
    pub samples: usize,
    pub train_samples: usize,
    pub holdout_samples: usize,
    pub candidates: Vec<CandidateReport>,
    pub warnings: Vec<RunWarning>,
    pub deadline_hit: bool,
}

impl TrainingReport {
    fn new(mode: TrainingMode, feature_version: &str) -> Self {
        Self {
            mode,
            feature_version: feature_version.to_string(),
            signals_claimed: 0,
            signals_completed: 0,
            priority_tickers: Vec::new(),
            tickers_used: Vec::new(),
            samples: 0,
            train_samples: 0,
            holdout_samples: 0,
            candidates: Vec::new(),
            warnings: Vec::new(),
            deadline_hit: false,
        }
    }
}

/// Trains candidate versions from stored feature windows and promotes winners
pub struct TrainingOrchestrator {
    market: Arc<dyn MarketDataSource>,
    store: Arc<FeatureStore>,
    registry: Arc<ModelRegistry>,
    signals: Arc<SignalQueue>,
    settings: TrainingSettings,
    label_horizon: usize,
    max_workers: usize,
}

impl TrainingOrchestrator {
    pub fn new(
        market: Arc<dyn MarketDataSource>,
        store: Arc<FeatureStore>,
        registry: Arc<ModelRegistry>,
        signals: Arc<SignalQueue>,
        settings: TrainingSettings,
        label_horizon: usize,
        max_workers: usize,
    ) -> Self {
        Self {
            market,
            store,
            registry,
            signals,
            settings,
            label_horizon: label_horizon.max(1),
            max_workers,
        }
    }

    pub async fn run(
        &self,
        mode: TrainingMode,
        universe: &[String],
        feature_version: &str,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<TrainingReport> {
        let mut report = TrainingReport::new(mode, feature_version);
        let claims = self.claim_signals(now, &mut report.warnings).await?;
        report.signals_claimed = claims.len();

        let signalled: Vec<_> = claims.iter().map(|c| c.signal.clone()).collect();
        report.priority_tickers = prioritized_tickers(&signalled);

        let mut ordered = report.priority_tickers.clone();
        if mode == TrainingMode::FullBatch {
            for ticker in universe {
                if !ordered.contains(ticker) {
                    ordered.push(ticker.clone());
                }
            }
        }
        if ordered.is_empty() {
            info!("No tickers to train on ({:?})", mode);
            return Ok(report);
        }

        info!("Training {} on {} tickers ({} prioritized)", feature_version, ordered.len(), report.priority_tickers.len());
        let (samples, tickers_used) = self
            .collect_samples(&ordered, feature_version, deadline, &mut report)
            .await?;
        report.tickers_used = tickers_used;
        report.samples = samples.len();

        if samples.len() < self.settings.min_training_samples {
            // Claims stay open and become reclaimable after the timeout
            report.warnings.push(RunWarning::new(
                WarningKind::DataInsufficiency,
                None,
                format!(
                    "{} labelled samples, need {}",
                    samples.len(),
                    self.settings.min_training_samples
                ),
            ));
            return Ok(report);
        }

        let split = split_chronological(samples, self.settings.holdout_fraction);
        report.train_samples = split.train.len();
        report.holdout_samples = split.holdout.len();
        let columns = self.columns_for(&report.tickers_used, feature_version).await?;

        for kind in self.settings.model_kinds.clone() {
            let candidate = self
                .train_candidate(kind, feature_version, &columns, &split, &report.tickers_used, deadline)
                .await?;
            if let Some(reason) = &candidate.1 {
                report.warnings.push(RunWarning::new(
                    WarningKind::TrainingFailure,
                    None,
                    format!("{}/{}: {}", kind, feature_version, reason),
                ));
            }
            report.candidates.push(candidate.0);
        }

        for claim in &claims {
            match self.signals.complete(claim, Utc::now()).await {
                Ok(()) => report.signals_completed += 1,
                Err(err) => report.warnings.push(RunWarning::from_error(Some(&claim.signal.ticker), err)?),
            }
        }

        Ok(report)
    }

    async fn claim_signals(&self, now: DateTime<Utc>, warnings: &mut Vec<RunWarning>) -> Result<Vec<SignalClaim>> {
        let timeout = Duration::minutes(self.settings.claim_timeout_mins);
        let candidates = self.signals.claimable(now, timeout).await?;
        let mut claims = Vec::new();
        for signal in candidates.into_iter().take(self.settings.max_signals_per_run) {
            match self.signals.claim(signal.id, now, timeout).await {
                Ok(claim) => claims.push(claim),
                Err(err) => warnings.push(RunWarning::from_error(Some(&signal.ticker), err)?),
            }
        }
        Ok(claims)
    }

    /// Loads samples per ticker in parallel, then keeps them in priority order up to the cap
    async fn collect_samples(
        &self,
        ordered: &[String],
        feature_version: &str,
        deadline: Instant,
        report: &mut TrainingReport,
    ) -> Result<(Vec<Sample>, Vec<String>)> {
        let outcome = for_each_ticker(ordered.to_vec(), self.max_workers, deadline, |ticker| async move {
            let result = self.samples_for(&ticker, feature_version).await;
            (ticker, result)
        })
        .await;
        report.deadline_hit = outcome.deadline_hit();
        let (loaded, warnings) = outcome.fold("training")?;
        report.warnings.extend(warnings);

        let mut by_ticker: HashMap<String, Vec<Sample>> = loaded.into_iter().collect();
        let mut samples = Vec::new();
        let mut used = Vec::new();
        for ticker in ordered {
            let remaining = self.settings.max_training_samples.saturating_sub(samples.len());
            if remaining == 0 {
                break;
            }
            if let Some(mut ticker_samples) = by_ticker.remove(ticker) {
                if ticker_samples.len() > remaining {
                    // Keep the most recent observations
                    ticker_samples.drain(..ticker_samples.len() - remaining);
                }
                if !ticker_samples.is_empty() {
                    used.push(ticker.clone());
                    samples.extend(ticker_samples);
                }
            }
        }
        Ok((samples, used))
    }

    async fn samples_for(&self, ticker: &str, feature_version: &str) -> Result<Vec<Sample>> {
        let windows = self.store.list_for(ticker, feature_version).await?;
        let (Some(first), Some(last)) = (windows.first(), windows.last()) else {
            return Err(PipelineError::DataInsufficiency {
                ticker: ticker.to_string(),
                needed: 1,
                available: 0,
            });
        };

        // Enough calendar slack to cover the label horizon after the last window
        let slack = Duration::days(14 + 2 * self.label_horizon as i64);
        let end = last.as_of.checked_add_signed(slack).unwrap_or(last.as_of);
        let series = PriceSeries::new(ticker, self.market.range(ticker, first.as_of, end).await?);

        let mut samples = Vec::with_capacity(windows.len());
        for window in &windows {
            let Some(base) = series.up_to(window.as_of).last() else { continue };
            let Some(future) = series.sessions_after(window.as_of, self.label_horizon) else { continue };
            let tensor = self.store.load_payload(window)?;
            let Some(row) = tensor.last_row() else { continue };
            samples.push(Sample {
                ticker: ticker.to_string(),
                as_of: window.as_of,
                features: row.to_vec(),
                up: future.close >= base.close,
            });
        }

        if samples.is_empty() {
            return Err(PipelineError::DataInsufficiency {
                ticker: ticker.to_string(),
                needed: 1,
                available: 0,
            });
        }
        Ok(samples)
    }

    async fn columns_for(&self, tickers: &[String], feature_version: &str) -> Result<Vec<String>> {
        for ticker in tickers {
            if let Some(window) = self.store.list_for(ticker, feature_version).await?.last() {
                return Ok(self.store.load_payload(window)?.columns);
            }
        }
        Ok(Vec::new())
    }

    /// Fit, evaluate, register and offer one candidate. Returns the failure reason, if any.
    async fn train_candidate(
        &self,
        kind: ModelKind,
        feature_version: &str,
        columns: &[String],
        split: &Split,
        tickers: &[String],
        deadline: Instant,
    ) -> Result<(CandidateReport, Option<String>)> {
        let (x_train, y_train) = to_matrix(&split.train)?;
        let settings = self.settings.clone();
        let version = feature_version.to_string();
        let cols = columns.to_vec();

        let fit = tokio::time::timeout_at(
            deadline,
            tokio::task::spawn_blocking(move || ModelArtifact::train(kind, &version, cols, &x_train, &y_train, &settings)),
        )
        .await;

        let fitted: std::result::Result<ModelArtifact, String> = match fit {
            Ok(Ok(Ok(artifact))) => Ok(artifact),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join)) => Err(format!("training task failed: {}", join)),
            Err(_) => Err("cycle deadline exceeded during fit".to_string()),
        };

        let range = TrainingRange {
            start: split.first_date(),
            end: split.last_date(),
        };

        let (metrics, artifact) = match fitted {
            Ok(artifact) => {
                let metrics = evaluate(&artifact, split, tickers);
                (metrics, Some(artifact))
            }
            Err(reason) => {
                warn!("{} candidate for {} failed: {}", kind, feature_version, reason);
                (ModelMetrics::failed(reason, split.train.len(), tickers.to_vec()), None)
            }
        };

        let record = self
            .registry
            .register(kind, feature_version, range, metrics, artifact.as_ref())
            .await?;
        let decision = self.registry.promote_if_better(&record).await?;

        Ok((
            CandidateReport {
                model_id: record.id.clone(),
                kind,
                score: record.metrics.evaluation_score(),
                decision,
            },
            record.metrics.failure.clone(),
        ))
    }
}

pub struct Split {
    pub train: Vec<Sample>,
    pub holdout: Vec<Sample>,
}

impl Split {
    fn first_date(&self) -> NaiveDate {
        self.train
            .first()
            .or(self.holdout.first())
            .map(|s| s.as_of)
            .unwrap_or_default()
    }

    fn last_date(&self) -> NaiveDate {
        self.holdout
            .last()
            .or(self.train.last())
            .map(|s| s.as_of)
            .unwrap_or_default()
    }
}

/// Chronological split: the newest `holdout_fraction` of samples is held out
pub fn split_chronological(mut samples: Vec<Sample>, holdout_fraction: f64) -> Split {
    samples.sort_by(|a, b| a.as_of.cmp(&b.as_of).then_with(|| a.ticker.cmp(&b.ticker)));
    let n = samples.len();
    let holdout_n = if n < 2 {
        0
    } else {
        ((n as f64 * holdout_fraction).ceil() as usize).clamp(1, n - 1)
    };
    let holdout = samples.split_off(n - holdout_n);
    Split { train: samples, holdout }
}

fn to_matrix(samples: &[Sample]) -> Result<(Array2<f64>, Vec<bool>)> {
    let cols = samples.first().map(|s| s.features.len()).unwrap_or(0);
    let mut flat = Vec::with_capacity(samples.len() * cols);
    for s in samples {
        if s.features.len() != cols {
            return Err(PipelineError::Corrupt(format!(
                "sample {} {} has {} features, expected {}",
                s.ticker,
                s.as_of,
                s.features.len(),
                cols
            )));
        }
        flat.extend_from_slice(&s.features);
    }
    let x = Array2::from_shape_vec((samples.len(), cols), flat)
        .map_err(|e| PipelineError::Corrupt(format!("design matrix: {}", e)))?;
    Ok((x, samples.iter().map(|s| s.up).collect()))
}

fn accuracy_of(artifact: &ModelArtifact, samples: &[Sample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let correct = samples
        .iter()
        .filter(|s| (artifact.score(&s.features).probability >= 0.5) == s.up)
        .count();
    Some(correct as f64 / samples.len() as f64)
}

/// Held-out metrics for a fitted artifact
pub fn evaluate(artifact: &ModelArtifact, split: &Split, tickers: &[String]) -> ModelMetrics {
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut fn_ = 0usize;
    let mut brier = 0.0;
    for s in &split.holdout {
        let p = artifact.score(&s.features).probability;
        let predicted_up = p >= 0.5;
        match (predicted_up, s.up) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
        let target = if s.up { 1.0 } else { 0.0 };
        brier += (p - target).powi(2);
    }

    let ratio = |num: usize, den: usize| (den > 0).then(|| num as f64 / den as f64);
    let holdout_n = split.holdout.len();
    ModelMetrics {
        train_accuracy: accuracy_of(artifact, &split.train),
        holdout_accuracy: accuracy_of(artifact, &split.holdout),
        precision: ratio(tp, tp + fp),
        recall: ratio(tp, tp + fn_),
        brier_score: (holdout_n > 0).then(|| brier / holdout_n as f64),
        train_samples: split.train.len(),
        holdout_samples: holdout_n,
        tickers: tickers.to_vec(),
        failure: None,
    }
}
