use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use super::repository::{AccuracyRepository, FeedbackRepository, ReviewedOutcome};
use crate::config::{ConfigOverrides, ConfigRepository, ConfigSnapshot, FeedbackSettings, PredictionSettings};
use crate::error::{Result, RunWarning};
use crate::ml::SignalQueue;
use crate::types::{AccuracyRecord, FeedbackMetric, Insight, MetricStatus, NewRetrainSignal};

const GLOBAL_SCOPE: &str = "global";

/// Daily metrics for one scope (all tickers, or one ticker)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeMetrics {
    pub records: usize,
    pub correct: usize,
    pub accuracy: f64,
    /// Predicted-UP rate minus realized-UP rate
    pub directional_bias: f64,
    /// 1 - Brier score
    pub calibration: f64,
}

impl ScopeMetrics {
    pub fn compute(outcomes: &[&ReviewedOutcome]) -> Option<Self> {
        if outcomes.is_empty() {
            return None;
        }
        let n = outcomes.len() as f64;
        let correct = outcomes.iter().filter(|o| o.record.is_correct).count();
        let predicted_up = outcomes.iter().filter(|o| o.predicted.is_up()).count() as f64;
        let realized_up = outcomes.iter().filter(|o| o.record.realized_direction.is_up()).count() as f64;
        let brier = outcomes
            .iter()
            .map(|o| {
                let target = if o.record.realized_direction.is_up() { 1.0 } else { 0.0 };
                (o.probability - target).powi(2)
            })
            .sum::<f64>()
            / n;

        Some(Self {
            records: outcomes.len(),
            correct,
            accuracy: correct as f64 / n,
            directional_bias: (predicted_up - realized_up) / n,
            calibration: (1.0 - brier).clamp(0.0, 1.0),
        })
    }
}

pub fn accuracy_status(value: f64) -> MetricStatus {
    match value {
        v if v >= 0.8 => MetricStatus::Excellent,
        v if v >= 0.6 => MetricStatus::Good,
        v if v >= 0.4 => MetricStatus::Fair,
        _ => MetricStatus::Critical,
    }
}

pub fn bias_status(value: f64) -> MetricStatus {
    match value.abs() {
        v if v <= 0.2 => MetricStatus::Excellent,
        v if v <= 0.4 => MetricStatus::Good,
        v if v <= 0.6 => MetricStatus::Fair,
        _ => MetricStatus::Critical,
    }
}

pub fn calibration_status(value: f64) -> MetricStatus {
    match value {
        v if v >= 0.85 => MetricStatus::Excellent,
        v if v >= 0.75 => MetricStatus::Good,
        v if v >= 0.6 => MetricStatus::Fair,
        _ => MetricStatus::Critical,
    }
}

/// Proposed change to the UP threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdRecommendation {
    pub rolling_accuracy: f64,
    pub current: f64,
    pub proposed: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedbackReport {
    pub as_of: Option<NaiveDate>,
    pub reviewed: usize,
    pub global: Option<ScopeMetrics>,
    pub metrics_written: usize,
    pub insights_written: usize,
    pub degraded_tickers: Vec<String>,
    pub signals_emitted: Vec<i64>,
    pub recommendation: Option<ThresholdRecommendation>,
    pub snapshot_version: Option<i64>,
    pub warnings: Vec<RunWarning>,
    pub deadline_hit: bool,
}

impl FeedbackReport {
    fn stop_at_deadline(&mut self, unfinished: usize) {
        warn!("Feedback deadline reached with {} scopes unfinished", unfinished);
        self.deadline_hit = true;
        self.warnings.push(RunWarning::deadline("feedback", unfinished));
    }
}

/// Turns realized outcomes into metrics, insights, retrain signals and threshold updates
pub struct FeedbackEngine {
    accuracy: Arc<AccuracyRepository>,
    feedback: Arc<FeedbackRepository>,
    signals: Arc<SignalQueue>,
    configs: Arc<ConfigRepository>,
    settings: FeedbackSettings,
}

impl FeedbackEngine {
    pub fn new(
        accuracy: Arc<AccuracyRepository>,
        feedback: Arc<FeedbackRepository>,
        signals: Arc<SignalQueue>,
        configs: Arc<ConfigRepository>,
        settings: FeedbackSettings,
    ) -> Self {
        Self {
            accuracy,
            feedback,
            signals,
            configs,
            settings,
        }
    }

    pub async fn run(
        &self,
        as_of: NaiveDate,
        snapshot: &ConfigSnapshot,
        prediction: &PredictionSettings,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<FeedbackReport> {
        let outcomes = self.accuracy.reviewed_on(as_of).await?;
        info!("Feedback review for {}: {} outcomes", as_of, outcomes.len());
        let mut report = FeedbackReport {
            as_of: Some(as_of),
            reviewed: outcomes.len(),
            ..Default::default()
        };

        let mut by_ticker: BTreeMap<&str, Vec<&ReviewedOutcome>> = BTreeMap::new();
        for outcome in &outcomes {
            by_ticker.entry(outcome.record.ticker.as_str()).or_default().push(outcome);
        }
        let all: Vec<&ReviewedOutcome> = outcomes.iter().collect();

        report.global = ScopeMetrics::compute(&all);
        let mut scopes: Vec<(&str, ScopeMetrics)> =
            report.global.clone().map(|global| (GLOBAL_SCOPE, global)).into_iter().collect();
        scopes.extend(
            by_ticker
                .iter()
                .filter_map(|(ticker, scoped)| ScopeMetrics::compute(scoped).map(|m| (*ticker, m))),
        );
        for (done, (scope, metrics)) in scopes.iter().enumerate() {
            if Instant::now() >= deadline {
                report.stop_at_deadline(scopes.len() - done);
                return Ok(report);
            }
            self.write_scope(as_of, scope, metrics, now, &mut report).await?;
        }

        self.detect_degradation(as_of, now, deadline, &mut report).await?;
        // A snapshot written from a partial review would be replayed by the next run
        if report.deadline_hit {
            return Ok(report);
        }

        if let Some(recommendation) = self.recommend_threshold(as_of, snapshot, prediction).await? {
            let overrides = ConfigOverrides {
                up_threshold: Some(recommendation.proposed),
                ..snapshot.overrides.clone()
            };
            let source = format!("feedback:{}", as_of);
            match self.configs.append(&overrides, &source, &recommendation.reason, now).await? {
                Some(created) => report.snapshot_version = Some(created.version),
                None => info!("Snapshot for {} already recorded", source),
            }
            report.recommendation = Some(recommendation);
        }

        info!(
            "Feedback done: {} metrics, {} insights, {} signals",
            report.metrics_written,
            report.insights_written,
            report.signals_emitted.len()
        );
        Ok(report)
    }

    async fn write_scope(
        &self,
        as_of: NaiveDate,
        scope: &str,
        metrics: &ScopeMetrics,
        now: DateTime<Utc>,
        report: &mut FeedbackReport,
    ) -> Result<()> {
        let suffix = if scope == GLOBAL_SCOPE {
            String::new()
        } else {
            format!(":{}", scope)
        };
        let details = json!({
            "scope": scope,
            "records": metrics.records,
            "correct": metrics.correct,
        });
        let rows = [
            ("accuracy", metrics.accuracy, accuracy_status(metrics.accuracy)),
            ("directional_bias", metrics.directional_bias, bias_status(metrics.directional_bias)),
            ("calibration", metrics.calibration, calibration_status(metrics.calibration)),
        ];

        for (name, value, status) in rows {
            let metric = FeedbackMetric {
                as_of,
                metric_name: format!("{}{}", name, suffix),
                value,
                status,
                details: details.clone(),
            };
            if self.feedback.insert_metric(&metric).await? {
                report.metrics_written += 1;
            }
            if status == MetricStatus::Critical {
                let message = match name {
                    "directional_bias" if value > 0.0 => format!("Predicted UP too often ({:+.2}) over {} outcomes", value, metrics.records),
                    "directional_bias" => format!("Predicted DOWN too often ({:+.2}) over {} outcomes", value, metrics.records),
                    _ => format!("{} is critical at {:.2} over {} outcomes", name, value, metrics.records),
                };
                self.insight(as_of, scope, name, message, now, report).await?;
            }
        }
        Ok(())
    }

    async fn insight(
        &self,
        as_of: NaiveDate,
        scope: &str,
        category: &str,
        message: String,
        now: DateTime<Utc>,
        report: &mut FeedbackReport,
    ) -> Result<()> {
        let insight = Insight {
            as_of,
            scope: scope.to_string(),
            category: category.to_string(),
            message,
            created_at: now,
        };
        if self.feedback.insert_insight(&insight).await? {
            report.insights_written += 1;
        }
        Ok(())
    }

    /// Emit a retrain signal for each ticker whose rolling accuracy fell below threshold
    async fn detect_degradation(
        &self,
        as_of: NaiveDate,
        now: DateTime<Utc>,
        deadline: Instant,
        report: &mut FeedbackReport,
    ) -> Result<()> {
        let since = as_of - Duration::days(self.settings.lookback_days);
        let tallies = self.accuracy.tally_by_ticker(since, as_of).await?;
        let total = tallies.len();
        for (done, (ticker, tally)) in tallies.into_iter().enumerate() {
            if Instant::now() >= deadline {
                report.stop_at_deadline(total - done);
                return Ok(());
            }
            let Some(accuracy) = tally.accuracy() else { continue };
            if (tally.total as usize) < self.settings.min_records || accuracy >= self.settings.accuracy_threshold {
                continue;
            }

            let history = self.accuracy.history(&ticker, since, as_of).await?;
            let Some(first) = history.first() else { continue };
            let streak = trailing_misses(&history);
            let confidence = degradation_confidence(accuracy, streak, &self.settings);
            let reason = format!(
                "accuracy {:.2} over {} outcomes below {:.2}; {} consecutive misses",
                accuracy, tally.total, self.settings.accuracy_threshold, streak
            );
            report.degraded_tickers.push(ticker.clone());

            let signal = NewRetrainSignal {
                ticker: ticker.clone(),
                reason: reason.clone(),
                confidence,
                window_start: first.verification_date,
                window_end: as_of,
            };
            if let Some(id) = self.signals.emit(&signal, now).await? {
                warn!("{} degraded: {}", ticker, reason);
                report.signals_emitted.push(id);
                self.insight(as_of, &ticker, "degradation", reason, now, report).await?;
            }
        }
        Ok(())
    }

    async fn recommend_threshold(
        &self,
        as_of: NaiveDate,
        snapshot: &ConfigSnapshot,
        prediction: &PredictionSettings,
    ) -> Result<Option<ThresholdRecommendation>> {
        let tally = self
            .accuracy
            .tally_between(as_of - Duration::days(self.settings.lookback_days), as_of)
            .await?;
        let Some(accuracy) = tally.accuracy() else { return Ok(None) };
        if (tally.total as usize) < self.settings.min_records {
            return Ok(None);
        }
        Ok(recommend(accuracy, snapshot.up_threshold(prediction), &self.settings))
    }
}

/// Incorrect outcomes at the end of an oldest-first history
pub fn trailing_misses(history: &[AccuracyRecord]) -> usize {
    history.iter().rev().take_while(|r| !r.is_correct).count()
}

/// Half magnitude (distance below threshold), half duration (miss streak)
pub fn degradation_confidence(accuracy: f64, streak: usize, settings: &FeedbackSettings) -> f64 {
    let magnitude = if settings.accuracy_threshold > 0.0 {
        ((settings.accuracy_threshold - accuracy) / settings.accuracy_threshold).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let duration = (streak as f64 / settings.streak_saturation.max(1) as f64).min(1.0);
    (0.5 * magnitude + 0.5 * duration).clamp(0.0, 1.0)
}

pub fn recommend(accuracy: f64, current: f64, settings: &FeedbackSettings) -> Option<ThresholdRecommendation> {
    let (proposed, why) = if accuracy < settings.lower_below {
        ((current - settings.threshold_step_down).max(settings.threshold_min), "low")
    } else if accuracy > settings.raise_above {
        ((current + settings.threshold_step_up).min(settings.threshold_max), "high")
    } else {
        return None;
    };
    if (proposed - current).abs() < 1e-9 {
        return None;
    }
    Some(ThresholdRecommendation {
        rolling_accuracy: accuracy,
        current,
        proposed,
        reason: format!(
            "rolling accuracy {:.2} is {}; up_threshold {:.2} -> {:.2}",
            accuracy, why, current, proposed
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::ml::ModelRegistry;
    use crate::prediction::PredictionRepository;
    use crate::error::WarningKind;
    use crate::test_support::{promoted_model_id, store_prediction};
    use crate::types::Direction;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn test_status_bands() {
        assert_eq!(accuracy_status(0.85), MetricStatus::Excellent);
        assert_eq!(accuracy_status(0.6), MetricStatus::Good);
        assert_eq!(accuracy_status(0.39), MetricStatus::Critical);
        assert_eq!(bias_status(-0.3), MetricStatus::Good);
        assert_eq!(bias_status(0.7), MetricStatus::Critical);
        assert_eq!(calibration_status(0.7), MetricStatus::Fair);
    }

    #[test]
    fn test_recommendation_steps_and_caps() {
        let settings = FeedbackSettings::default();
        let lower = recommend(0.3, 0.5, &settings).unwrap();
        assert!((lower.proposed - 0.45).abs() < 1e-12);
        assert!((recommend(0.3, 0.32, &settings).unwrap().proposed - 0.3).abs() < 1e-12);
        assert!(recommend(0.3, 0.3, &settings).is_none());
        assert!((recommend(0.8, 0.5, &settings).unwrap().proposed - 0.51).abs() < 1e-12);
        assert!(recommend(0.8, 0.7, &settings).is_none());
        assert!(recommend(0.55, 0.5, &settings).is_none());
    }

    #[test]
    fn test_confidence_combines_magnitude_and_streak() {
        let settings = FeedbackSettings::default();
        assert!((degradation_confidence(0.0, 3, &settings) - 0.8).abs() < 1e-12);
        assert!((degradation_confidence(0.2, 10, &settings) - 0.75).abs() < 1e-12);
        assert!(degradation_confidence(0.39, 0, &settings) < 0.02);
    }

    struct Harness {
        _db: Database,
        _dir: tempfile::TempDir,
        predictions: PredictionRepository,
        accuracy: Arc<AccuracyRepository>,
        feedback: Arc<FeedbackRepository>,
        signals: Arc<SignalQueue>,
        configs: Arc<ConfigRepository>,
        engine: FeedbackEngine,
        model_id: String,
    }

    async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(db.pool().clone(), dir.path());
        let model_id = promoted_model_id(&registry, "v1-test").await;
        let accuracy = Arc::new(AccuracyRepository::new(db.pool().clone()));
        let feedback = Arc::new(FeedbackRepository::new(db.pool().clone()));
        let signals = Arc::new(SignalQueue::new(db.pool().clone()));
        let configs = Arc::new(ConfigRepository::new(db.pool().clone()));
        let engine = FeedbackEngine::new(
            accuracy.clone(),
            feedback.clone(),
            signals.clone(),
            configs.clone(),
            FeedbackSettings::default(),
        );
        Harness {
            predictions: PredictionRepository::new(db.pool().clone()),
            _db: db,
            _dir: dir,
            accuracy,
            feedback,
            signals,
            configs,
            engine,
            model_id,
        }
    }

    /// A prediction made the session before `verified` and its realized outcome
    async fn outcome(h: &Harness, ticker: &str, verified: NaiveDate, predicted: Direction, realized: Direction) {
        let made = verified - Duration::days(1);
        let p = store_prediction(&h.predictions, ticker, made, &h.model_id, predicted, 0.7).await;
        let inserted = h
            .accuracy
            .insert(&AccuracyRecord {
                prediction_id: p.id,
                ticker: ticker.to_string(),
                prediction_date: made,
                verification_date: verified,
                realized_direction: realized,
                price_move: if realized.is_up() { 0.01 } else { -0.01 },
                is_correct: predicted == realized,
                validation_source: "close_vs_close".into(),
                validated_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(inserted);
    }

    async fn run(h: &Harness, as_of: NaiveDate) -> FeedbackReport {
        let snapshot = h.configs.latest().await.unwrap();
        h.engine
            .run(as_of, &snapshot, &PredictionSettings::default(), Utc::now(), far_deadline())
            .await
            .unwrap()
    }

    fn far_deadline() -> Instant {
        Instant::now() + std::time::Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_three_misses_emit_exactly_one_signal() {
        let h = harness().await;
        let mut reports = Vec::new();
        for day in [5, 6, 7] {
            outcome(&h, "ABC", d(day), Direction::Up, Direction::Down).await;
            outcome(&h, "XYZ", d(day), Direction::Up, Direction::Up).await;
            reports.push(run(&h, d(day)).await);
        }

        assert!(reports[0].signals_emitted.is_empty());
        assert!(reports[1].signals_emitted.is_empty());
        assert_eq!(reports[2].degraded_tickers, vec!["ABC".to_string()]);
        assert_eq!(reports[2].signals_emitted.len(), 1);

        // Reruns and later days do not duplicate while the signal is open
        assert!(run(&h, d(7)).await.signals_emitted.is_empty());
        outcome(&h, "ABC", d(8), Direction::Up, Direction::Down).await;
        assert!(run(&h, d(8)).await.signals_emitted.is_empty());

        let open = h.signals.open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].ticker, "ABC");
        assert_eq!(open[0].window_start, d(5));
        assert_eq!(open[0].window_end, d(7));
        assert!((open[0].confidence - 0.8).abs() < 1e-9);
        assert!(open[0].reason.contains("3 consecutive misses"));
    }

    #[tokio::test]
    async fn test_review_ignores_outcomes_verified_later() {
        let h = harness().await;
        for day in [5, 6, 7] {
            outcome(&h, "ABC", d(day), Direction::Up, Direction::Down).await;
            outcome(&h, "XYZ", d(day), Direction::Up, Direction::Up).await;
        }

        // Replaying earlier dates sees only what was verified by then
        let first = run(&h, d(5)).await;
        assert!(first.degraded_tickers.is_empty());
        assert!(first.signals_emitted.is_empty());
        let second = run(&h, d(6)).await;
        assert!(second.degraded_tickers.is_empty());
        assert!(h.signals.open().await.unwrap().is_empty());

        let third = run(&h, d(7)).await;
        assert_eq!(third.signals_emitted.len(), 1);
        let open = h.signals.open().await.unwrap();
        assert!((open[0].confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_daily_metrics_are_idempotent() {
        let h = harness().await;
        outcome(&h, "ABC", d(5), Direction::Up, Direction::Up).await;
        outcome(&h, "XYZ", d(5), Direction::Up, Direction::Down).await;

        let first = run(&h, d(5)).await;
        assert_eq!(first.reviewed, 2);
        // 3 global + 3 per ticker for two tickers
        assert_eq!(first.metrics_written, 9);
        let global = first.global.unwrap();
        assert_eq!(global.accuracy, 0.5);
        assert!((global.directional_bias - 0.5).abs() < 1e-12);

        let second = run(&h, d(5)).await;
        assert_eq!(second.metrics_written, 0);
        assert_eq!(second.insights_written, 0);

        let metrics = h.feedback.metrics_since(d(5)).await.unwrap();
        assert_eq!(metrics.len(), 9);
        let xyz = metrics.iter().find(|m| m.metric_name == "accuracy:XYZ").unwrap();
        assert_eq!(xyz.status, MetricStatus::Critical);
        let insights = h.feedback.insights_since(d(5)).await.unwrap();
        assert!(insights.iter().any(|i| i.scope == "XYZ" && i.category == "accuracy"));
    }

    #[tokio::test]
    async fn test_low_accuracy_writes_one_snapshot_per_day() {
        let h = harness().await;
        for ticker in ["AAA", "BBB", "CCC", "DDD"] {
            outcome(&h, ticker, d(5), Direction::Up, Direction::Down).await;
        }

        let report = run(&h, d(5)).await;
        let rec = report.recommendation.unwrap();
        assert!((rec.proposed - 0.45).abs() < 1e-12);
        assert_eq!(report.snapshot_version, Some(1));

        let latest = h.configs.latest().await.unwrap();
        assert_eq!(latest.source, "feedback:2024-03-05");
        assert_eq!(latest.overrides.up_threshold, Some(0.45));

        // Same date again: no second snapshot
        let again = run(&h, d(5)).await;
        assert_eq!(again.snapshot_version, None);
        assert_eq!(h.configs.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_defers_review() {
        let h = harness().await;
        for ticker in ["AAA", "BBB", "CCC", "DDD"] {
            outcome(&h, ticker, d(5), Direction::Up, Direction::Down).await;
        }
        let snapshot = h.configs.latest().await.unwrap();

        let report = h
            .engine
            .run(d(5), &snapshot, &PredictionSettings::default(), Utc::now(), Instant::now())
            .await
            .unwrap();
        assert!(report.deadline_hit);
        assert_eq!(report.reviewed, 4);
        assert_eq!(report.metrics_written, 0);
        assert_eq!(report.snapshot_version, None);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::DeadlineExceeded);
        assert!(h.configs.list(10).await.unwrap().is_empty());

        let retry = run(&h, d(5)).await;
        assert!(!retry.deadline_hit);
        assert_eq!(retry.metrics_written, 15);
        assert_eq!(retry.snapshot_version, Some(1));
    }
}
