use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::bounds;
use super::repository::{InsertOutcome, PredictionRepository};
use crate::config::{ConfigSnapshot, Settings};
use crate::error::{PipelineError, Result, RunWarning};
use crate::features::{canonical_ticker, prediction_id, FeatureStore};
use crate::ml::ModelRegistry;
use crate::pipeline::partition::for_each_ticker;
use crate::types::{DiagnosticEntry, Diagnostics, ModelKind, Prediction, PromotionKey};

/// Everything one prediction run reads from settings and the active snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionConfig {
    pub config_version: i64,
    pub feature_version: String,
    pub model_kind: ModelKind,
    pub up_threshold: f64,
    pub probability_floor: f64,
    pub probability_ceiling: f64,
    pub max_window_age_days: i64,
    pub max_model_age_days: i64,
}

impl PredictionConfig {
    pub fn resolve(settings: &Settings, snapshot: &ConfigSnapshot) -> Self {
        let (floor, ceiling) = snapshot.bounds(&settings.prediction);
        Self {
            config_version: snapshot.version,
            feature_version: snapshot.feature_version(settings),
            model_kind: settings.prediction.model_kind,
            up_threshold: snapshot.up_threshold(&settings.prediction),
            probability_floor: floor,
            probability_ceiling: ceiling,
            max_window_age_days: settings.prediction.max_window_age_days,
            max_model_age_days: settings.prediction.max_model_age_days,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictionReport {
    pub as_of: Option<NaiveDate>,
    pub tickers_requested: usize,
    pub created: usize,
    pub existing: usize,
    pub prediction_ids: Vec<String>,
    pub warnings: Vec<RunWarning>,
    pub deadline_hit: bool,
}

/// Scores the latest feature window of each ticker with the promoted model
pub struct PredictionService {
    store: Arc<FeatureStore>,
    registry: Arc<ModelRegistry>,
    predictions: Arc<PredictionRepository>,
    max_workers: usize,
}

impl PredictionService {
    pub fn new(
        store: Arc<FeatureStore>,
        registry: Arc<ModelRegistry>,
        predictions: Arc<PredictionRepository>,
        max_workers: usize,
    ) -> Self {
        Self {
            store,
            registry,
            predictions,
            max_workers,
        }
    }

    pub async fn run(
        &self,
        tickers: Vec<String>,
        as_of: NaiveDate,
        config: &PredictionConfig,
        deadline: Instant,
    ) -> Result<PredictionReport> {
        let tickers: Vec<String> = tickers.iter().map(|t| canonical_ticker(t)).collect();
        info!(
            "Predicting {} tickers as of {} with {} (config v{})",
            tickers.len(),
            as_of,
            config.feature_version,
            config.config_version
        );

        let mut report = PredictionReport {
            as_of: Some(as_of),
            tickers_requested: tickers.len(),
            ..Default::default()
        };

        let outcome = for_each_ticker(tickers, self.max_workers, deadline, |ticker| async move {
            let result = self.predict_one(&ticker, as_of, config).await;
            (ticker, result)
        })
        .await;
        report.deadline_hit = outcome.deadline_hit();
        let (done, warnings) = outcome.fold("prediction")?;
        for (_, (id, created)) in done {
            if created {
                report.created += 1;
            } else {
                report.existing += 1;
            }
            report.prediction_ids.push(id);
        }
        report.warnings = warnings;

        info!(
            "Prediction done: {} created, {} existing, {} warnings",
            report.created,
            report.existing,
            report.warnings.len()
        );
        Ok(report)
    }

    async fn predict_one(&self, ticker: &str, as_of: NaiveDate, config: &PredictionConfig) -> Result<(String, bool)> {
        let window = self
            .store
            .latest_for(ticker, as_of, &config.feature_version)
            .await?
            .ok_or_else(|| PipelineError::DataInsufficiency {
                ticker: ticker.to_string(),
                needed: 1,
                available: 0,
            })?;

        let window_age = (as_of - window.as_of).num_days();
        if window_age > config.max_window_age_days {
            return Err(PipelineError::StaleArtifact {
                ticker: ticker.to_string(),
                reason: format!("latest feature window is {} days old ({})", window_age, window.as_of),
            });
        }

        let key = PromotionKey::new(config.model_kind, window.feature_version.clone());
        let model = self
            .registry
            .promoted(&key)
            .await?
            .ok_or_else(|| PipelineError::StaleArtifact {
                ticker: ticker.to_string(),
                reason: format!("no promoted model for {}", key),
            })?;

        let model_age = (as_of - model.training_range.end).num_days();
        if model_age > config.max_model_age_days {
            return Err(PipelineError::StaleArtifact {
                ticker: ticker.to_string(),
                reason: format!("model {} trained through {} is {} days old", model.id, model.training_range.end, model_age),
            });
        }

        let artifact = self.registry.load_artifact(&model)?;
        let tensor = self.store.load_payload(&window)?;
        if artifact.feature_columns != tensor.columns {
            return Err(PipelineError::StaleArtifact {
                ticker: ticker.to_string(),
                reason: format!("model {} expects columns {:?}", model.id, artifact.feature_columns),
            });
        }
        let row = tensor.last_row().ok_or_else(|| PipelineError::DataInsufficiency {
            ticker: ticker.to_string(),
            needed: 1,
            available: 0,
        })?;

        let scored = artifact.score(row);
        let bounded = bounds::apply(
            scored.probability,
            scored.diversity,
            config.probability_floor,
            config.probability_ceiling,
            config.up_threshold,
        );

        let mut diagnostics = Diagnostics::default();
        diagnostics.push(bounded.diagnostic());
        for member in &scored.members {
            diagnostics.push(DiagnosticEntry::ModelContribution {
                model: member.name.to_string(),
                probability: member.probability,
                weight: member.weight,
            });
        }
        diagnostics.push(DiagnosticEntry::FeatureSource {
            feature_id: window.id.clone(),
            feature_version: window.feature_version.clone(),
            window_as_of: window.as_of,
        });
        diagnostics.push(DiagnosticEntry::ConfigSnapshot {
            config_version: config.config_version,
            up_threshold: config.up_threshold,
        });

        let prediction = Prediction {
            id: prediction_id(ticker, window.as_of, &model.id),
            ticker: ticker.to_string(),
            as_of: window.as_of,
            model_id: model.id.clone(),
            label: bounded.label,
            probability: bounded.probability,
            confidence: bounded.confidence,
            ensemble_score: bounded.diversity,
            input_ref: window.id.clone(),
            diagnostics,
            created_at: Utc::now(),
        };

        match self.predictions.insert(&prediction).await? {
            InsertOutcome::Inserted => {
                debug!(
                    "{} {} p={:.3} conf={:.3}",
                    ticker, prediction.label, prediction.probability, prediction.confidence
                );
                Ok((prediction.id, true))
            }
            InsertOutcome::AlreadyExists => Ok((prediction.id, false)),
            InsertOutcome::NotPromoted => Err(PipelineError::StaleArtifact {
                ticker: ticker.to_string(),
                reason: format!("model {} was demoted during the run", model.id),
            }),
            InsertOutcome::MissingModel => Err(PipelineError::RegistryInconsistency {
                key: key.to_string(),
                detail: format!("prediction for {} references missing model", ticker),
                records: vec![model.id],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, SqliteMarketData};
    use crate::error::WarningKind;
    use crate::features::{FeatureBuilder, FeatureParams};
    use crate::test_support::{constant_artifact, synthetic_bars};
    use crate::types::{Direction, ModelMetrics, TrainingRange};
    use std::time::Duration;

    struct Harness {
        _db: Database,
        _dir: tempfile::TempDir,
        registry: Arc<ModelRegistry>,
        repo: Arc<PredictionRepository>,
        service: PredictionService,
        builder: FeatureBuilder,
        params: FeatureParams,
        as_of: NaiveDate,
    }

    async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(SqliteMarketData::new(db.pool().clone()));
        let store = Arc::new(FeatureStore::new(db.pool().clone(), dir.path()));
        let registry = Arc::new(ModelRegistry::new(db.pool().clone(), dir.path().join("models")));
        let repo = Arc::new(PredictionRepository::new(db.pool().clone()));

        let mut params = FeatureParams::default();
        params.window_length = 10;
        let bars = synthetic_bars("ABC", 60, 0.0);
        let as_of = bars[59].date;
        market.insert_bars(&bars).await.unwrap();
        let builder = FeatureBuilder::new(market, store.clone(), 2);
        builder.build(vec!["ABC".into()], as_of, &params, 0, deadline()).await.unwrap();

        Harness {
            service: PredictionService::new(store, registry.clone(), repo.clone(), 2),
            builder,
            _db: db,
            _dir: dir,
            registry,
            repo,
            params,
            as_of,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn config(params: &FeatureParams) -> PredictionConfig {
        PredictionConfig {
            config_version: 3,
            feature_version: params.version(),
            model_kind: ModelKind::Ensemble,
            up_threshold: 0.5,
            probability_floor: 0.05,
            probability_ceiling: 0.95,
            max_window_age_days: 5,
            max_model_age_days: 90,
        }
    }

    async fn promote(h: &Harness, intercept: f64, trained_through: NaiveDate) -> String {
        let artifact = constant_artifact(ModelKind::Ensemble, &h.params, intercept);
        let record = h
            .registry
            .register(
                ModelKind::Ensemble,
                &h.params.version(),
                TrainingRange {
                    start: trained_through - chrono::Duration::days(60),
                    end: trained_through,
                },
                ModelMetrics {
                    holdout_accuracy: Some(0.6),
                    ..ModelMetrics::default()
                },
                Some(&artifact),
            )
            .await
            .unwrap();
        h.registry.promote_if_better(&record).await.unwrap();
        record.id
    }

    #[tokio::test]
    async fn test_no_promoted_model_yields_warning_and_no_records() {
        let h = harness().await;
        let report = h.service.run(vec!["ABC".into()], h.as_of, &config(&h.params), deadline()).await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::StaleArtifact);
        assert!(h.repo.recent(None, 0.0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prediction_is_bounded_labelled_and_idempotent() {
        let h = harness().await;
        let model_id = promote(&h, 5.0, h.as_of).await;
        let cfg = config(&h.params);

        let first = h.service.run(vec!["abc".into()], h.as_of, &cfg, deadline()).await.unwrap();
        assert_eq!(first.created, 1);
        let again = h.service.run(vec!["ABC".into()], h.as_of, &cfg, deadline()).await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.existing, 1);
        assert_eq!(first.prediction_ids, again.prediction_ids);

        let stored = h.repo.get(&first.prediction_ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.model_id, model_id);
        assert_eq!(stored.label, Direction::Up);
        assert_eq!(stored.probability, 0.95);
        assert!(stored.diagnostics.was_clamped());
        assert_eq!(stored.diagnostics.contributions().len(), 1);
        assert!(stored
            .diagnostics
            .entries
            .iter()
            .any(|e| matches!(e, DiagnosticEntry::ConfigSnapshot { config_version: 3, .. })));
    }

    #[tokio::test]
    async fn test_threshold_comes_from_config() {
        let h = harness().await;
        // sigmoid(0.2) ~ 0.55
        promote(&h, 0.2, h.as_of).await;
        let mut cfg = config(&h.params);
        cfg.up_threshold = 0.6;
        let report = h.service.run(vec!["ABC".into()], h.as_of, &cfg, deadline()).await.unwrap();
        let stored = h.repo.get(&report.prediction_ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.label, Direction::Down);
    }

    #[tokio::test]
    async fn test_stale_window_and_model_are_skipped() {
        let h = harness().await;
        promote(&h, 1.0, h.as_of - chrono::Duration::days(200)).await;
        let cfg = config(&h.params);

        let report = h.service.run(vec!["ABC".into()], h.as_of, &cfg, deadline()).await.unwrap();
        assert_eq!(report.warnings[0].kind, WarningKind::StaleArtifact);
        assert!(report.warnings[0].message.contains("days old"));

        let later = h.as_of + chrono::Duration::days(30);
        let report = h.service.run(vec!["ABC".into()], later, &cfg, deadline()).await.unwrap();
        assert!(report.warnings[0].message.contains("feature window"));
    }

    #[tokio::test]
    async fn test_rebuild_after_feed_stalls_is_stale() {
        let h = harness().await;
        promote(&h, 1.0, h.as_of).await;
        let later = h.as_of + chrono::Duration::days(45);

        let build = h.builder.build(vec!["ABC".into()], later, &h.params, 0, deadline()).await.unwrap();
        assert_eq!(build.windows_created, 0);
        assert_eq!(build.windows_existing, 1);

        let report = h.service.run(vec!["ABC".into()], later, &config(&h.params), deadline()).await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::StaleArtifact);
        assert!(report.warnings[0].message.contains("feature window is 45 days old"));
        assert!(h.repo.recent(None, 0.0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_window_is_data_insufficiency() {
        let h = harness().await;
        promote(&h, 1.0, h.as_of).await;
        let report = h
            .service
            .run(vec!["ABC".into(), "NOPE".into()], h.as_of, &config(&h.params), deadline())
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::DataInsufficiency);
        assert_eq!(report.warnings[0].ticker.as_deref(), Some("NOPE"));
    }
}
