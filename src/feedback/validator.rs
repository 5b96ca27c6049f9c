use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::repository::AccuracyRepository;
use crate::config::ValidationSettings;
use crate::database::MarketDataSource;
use crate::error::{PipelineError, Result, RunWarning};
use crate::prediction::PredictionRepository;
use crate::types::{AccuracyRecord, Direction, Prediction};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub today: Option<NaiveDate>,
    pub horizon_sessions: usize,
    pub candidates: usize,
    pub validated: usize,
    pub correct: usize,
    pub pending: usize,
    pub unverifiable: usize,
    pub already_validated: usize,
    pub rolling_accuracy: Option<f64>,
    pub rolling_records: i64,
    pub warnings: Vec<RunWarning>,
    pub deadline_hit: bool,
}

enum Verdict {
    Recorded { correct: bool },
    AlreadyValidated,
    Pending,
    Unverifiable,
}

/// Compares past predictions with realized closes once enough sessions have printed
pub struct Validator {
    market: Arc<dyn MarketDataSource>,
    predictions: Arc<PredictionRepository>,
    accuracy: Arc<AccuracyRepository>,
    settings: ValidationSettings,
}

impl Validator {
    pub fn new(
        market: Arc<dyn MarketDataSource>,
        predictions: Arc<PredictionRepository>,
        accuracy: Arc<AccuracyRepository>,
        settings: ValidationSettings,
    ) -> Self {
        Self {
            market,
            predictions,
            accuracy,
            settings,
        }
    }

    pub async fn run(
        &self,
        today: NaiveDate,
        horizon: Option<usize>,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<ValidationReport> {
        let horizon = horizon.unwrap_or(self.settings.horizon_sessions).max(1);
        // Pending predictions must stay candidates until they can be marked unverifiable
        let window = self.settings.lookback_days.max(self.settings.max_staleness_days + 1);
        let since = today - Duration::days(window);
        let until = today - Duration::days(1);
        let candidates = self.predictions.unvalidated(since, until).await?;
        info!(
            "Validating {} predictions from {} to {} (horizon {} sessions)",
            candidates.len(),
            since,
            until,
            horizon
        );

        let mut report = ValidationReport {
            today: Some(today),
            horizon_sessions: horizon,
            candidates: candidates.len(),
            ..Default::default()
        };

        for (done, prediction) in candidates.iter().enumerate() {
            let verdict = if Instant::now() >= deadline {
                None
            } else {
                tokio::time::timeout_at(deadline, self.validate_one(prediction, horizon, today, now))
                    .await
                    .ok()
            };
            let Some(verdict) = verdict else {
                let unfinished = candidates.len() - done;
                warn!("Validation deadline reached with {} predictions unchecked", unfinished);
                report.deadline_hit = true;
                report.warnings.push(RunWarning::deadline("validation", unfinished));
                break;
            };
            match verdict {
                Ok(Verdict::Recorded { correct }) => {
                    report.validated += 1;
                    if correct {
                        report.correct += 1;
                    }
                }
                Ok(Verdict::AlreadyValidated) => report.already_validated += 1,
                Ok(Verdict::Pending) => report.pending += 1,
                Ok(Verdict::Unverifiable) => report.unverifiable += 1,
                Err(err) => report.warnings.push(RunWarning::from_error(Some(&prediction.ticker), err)?),
            }
        }

        let rolling = self
            .accuracy
            .tally_between(today - Duration::days(self.settings.rolling_window_days), today)
            .await?;
        report.rolling_accuracy = rolling.accuracy();
        report.rolling_records = rolling.total;

        info!(
            "Validation done: {} validated ({} correct), {} pending, {} unverifiable",
            report.validated, report.correct, report.pending, report.unverifiable
        );
        Ok(report)
    }

    async fn validate_one(
        &self,
        prediction: &Prediction,
        horizon: usize,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        let base = self.market.history(&prediction.ticker, prediction.as_of, 1).await?;
        let later = self
            .market
            .sessions_after(&prediction.ticker, prediction.as_of, horizon)
            .await?;

        let (Some(base), Some(realized)) = (base.last(), later.get(horizon - 1)) else {
            let age = (today - prediction.as_of).num_days();
            if age > self.settings.max_staleness_days {
                let reason = format!("no {}-session outcome after {} days", horizon, age);
                self.accuracy.exclude(&prediction.id, &reason, now).await?;
                info!("Prediction {} for {} marked unverifiable: {}", prediction.id, prediction.ticker, reason);
                return Ok(Verdict::Unverifiable);
            }
            debug!(
                "{}",
                PipelineError::OutcomePending {
                    prediction_id: prediction.id.clone()
                }
            );
            return Ok(Verdict::Pending);
        };

        let base_close = base.close_f64();
        if base_close <= 0.0 {
            return Err(PipelineError::DataInsufficiency {
                ticker: prediction.ticker.clone(),
                needed: 1,
                available: 0,
            });
        }
        let price_move = ((realized.close - base.close) / base.close).to_f64().unwrap_or(0.0);
        let realized_direction = Direction::from_move(price_move);
        let is_correct = realized_direction == prediction.label;

        let record = AccuracyRecord {
            prediction_id: prediction.id.clone(),
            ticker: prediction.ticker.clone(),
            prediction_date: prediction.as_of,
            verification_date: realized.date,
            realized_direction,
            price_move,
            is_correct,
            validation_source: self.settings.source.clone(),
            validated_at: now,
        };

        if self.accuracy.insert(&record).await? {
            debug!(
                "{} {} predicted {} realized {} ({:+.4})",
                prediction.ticker, prediction.as_of, prediction.label, realized_direction, price_move
            );
            Ok(Verdict::Recorded { correct: is_correct })
        } else {
            Ok(Verdict::AlreadyValidated)
        }
    }
}
