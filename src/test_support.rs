//! Fixtures shared by unit tests across modules

use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use rust_decimal::Decimal;

use crate::features::FeatureParams;
use crate::ml::ensemble::{Estimator, WeightedEstimator};
use crate::ml::estimators::{LogisticModel, Standardizer};
use crate::ml::{ModelArtifact, ModelRegistry};
use crate::prediction::{InsertOutcome, PredictionRepository};
use crate::types::{Diagnostics, Direction, ModelKind, ModelMetrics, Prediction, PriceBar, TrainingRange};

fn dec(v: f64) -> Decimal {
    Decimal::try_from(v).unwrap().round_dp(4)
}

/// Trading days (Mon-Fri) starting 2024-01-01
pub fn trading_days(n: usize) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(n);
    let mut date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    while days.len() < n {
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(date);
        }
        date += Duration::days(1);
    }
    days
}

/// Deterministic oscillating price path with a mild upward drift
pub fn synthetic_bars(ticker: &str, n: usize, phase: f64) -> Vec<PriceBar> {
    let mut prev_close = 100.0 + 8.0 * phase.sin();
    trading_days(n)
        .into_iter()
        .enumerate()
        .map(|(i, date)| {
            let t = i as f64;
            let close = 100.0 + 8.0 * (t * 0.3 + phase).sin() + 0.05 * t;
            let open = prev_close;
            prev_close = close;
            PriceBar {
                ticker: ticker.to_string(),
                date,
                open: dec(open),
                high: dec(open.max(close) + 0.5),
                low: dec(open.min(close) - 0.5),
                close: dec(close),
                volume: dec(1000.0 + 100.0 * (t * 0.7).cos()),
            }
        })
        .collect()
}

/// Bars with explicit closes, one per trading day from 2024-01-01
pub fn bars_from_closes(ticker: &str, closes: &[f64]) -> Vec<PriceBar> {
    trading_days(closes.len())
        .into_iter()
        .zip(closes)
        .map(|(date, close)| PriceBar {
            ticker: ticker.to_string(),
            date,
            open: dec(*close),
            high: dec(close + 0.5),
            low: dec(close - 0.5),
            close: dec(*close),
            volume: dec(1000.0),
        })
        .collect()
}

/// Artifact that ignores its inputs and always returns `sigmoid(intercept)`
pub fn constant_artifact(kind: ModelKind, params: &FeatureParams, intercept: f64) -> ModelArtifact {
    let columns = params.columns();
    let width = columns.len();
    ModelArtifact {
        kind,
        feature_version: params.version(),
        feature_columns: columns,
        members: vec![WeightedEstimator {
            estimator: Estimator::Logistic(LogisticModel {
                coefficients: vec![0.0; width],
                intercept,
                scaler: Standardizer {
                    means: vec![0.0; width],
                    stds: vec![1.0; width],
                },
            }),
            weight: 1.0,
        }],
    }
}

/// Register and promote an artifact-less ensemble version, returning its id
pub async fn promoted_model_id(registry: &ModelRegistry, feature_version: &str) -> String {
    let record = registry
        .register(
            ModelKind::Ensemble,
            feature_version,
            TrainingRange {
                start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            },
            ModelMetrics {
                holdout_accuracy: Some(0.55),
                ..ModelMetrics::default()
            },
            None,
        )
        .await
        .unwrap();
    registry.promote_if_better(&record).await.unwrap();
    record.id
}

/// Store a prediction made by `model_id`; panics unless it was inserted
pub async fn store_prediction(
    repo: &PredictionRepository,
    ticker: &str,
    as_of: NaiveDate,
    model_id: &str,
    label: Direction,
    probability: f64,
) -> Prediction {
    let prediction = Prediction {
        id: crate::features::prediction_id(ticker, as_of, model_id),
        ticker: ticker.to_string(),
        as_of,
        model_id: model_id.to_string(),
        label,
        probability,
        confidence: ((probability - 0.5).abs() * 2.0).min(1.0),
        ensemble_score: 0.0,
        input_ref: format!("{}-{}", ticker, as_of),
        diagnostics: Diagnostics::default(),
        created_at: Utc::now(),
    };
    assert_eq!(repo.insert(&prediction).await.unwrap(), InsertOutcome::Inserted);
    prediction
}
