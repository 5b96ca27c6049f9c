use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::database::{format_date, format_ts, parse_date, parse_ts};
use crate::error::Result;
use crate::types::{Diagnostics, Direction, Prediction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    /// Same id already stored; the earlier record is kept
    AlreadyExists,
    /// Model exists but was not promoted when the record was created
    NotPromoted,
    MissingModel,
}

const PREDICTION_COLUMNS: &str = "id, ticker, as_of, model_id, label, probability, confidence, ensemble_score, input_ref, diagnostics, created_at";

/// Append-only prediction records
pub struct PredictionRepository {
    pool: SqlitePool,
}

impl PredictionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert only while the referenced model is promoted as of `created_at`
    pub async fn insert(&self, prediction: &Prediction) -> Result<InsertOutcome> {
        let created_at = format_ts(prediction.created_at);
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO predictions
                (id, ticker, as_of, model_id, label, probability, confidence,
                 ensemble_score, input_ref, diagnostics, created_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM model_versions
                WHERE id = ? AND promoted_at IS NOT NULL AND promoted_at <= ?
            )
            "#,
        )
        .bind(&prediction.id)
        .bind(&prediction.ticker)
        .bind(format_date(prediction.as_of))
        .bind(&prediction.model_id)
        .bind(prediction.label.as_str())
        .bind(prediction.probability)
        .bind(prediction.confidence)
        .bind(prediction.ensemble_score)
        .bind(&prediction.input_ref)
        .bind(serde_json::to_string(&prediction.diagnostics)?)
        .bind(&created_at)
        .bind(&prediction.model_id)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        if self.get(&prediction.id).await?.is_some() {
            debug!("Prediction {} already stored", prediction.id);
            return Ok(InsertOutcome::AlreadyExists);
        }
        let model: Option<(String,)> = sqlx::query_as("SELECT id FROM model_versions WHERE id = ?")
            .bind(&prediction.model_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match model {
            Some(_) => InsertOutcome::NotPromoted,
            None => InsertOutcome::MissingModel,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Prediction>> {
        let row = sqlx::query(&format!("SELECT {} FROM predictions WHERE id = ?", PREDICTION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_prediction).transpose()
    }

    /// Newest first, optionally filtered by ticker and minimum confidence
    pub async fn recent(&self, ticker: Option<&str>, min_confidence: f64, limit: i64) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM predictions
            WHERE (? IS NULL OR ticker = ?) AND confidence >= ?
            ORDER BY as_of DESC, created_at DESC, id ASC
            LIMIT ?
            "#,
            PREDICTION_COLUMNS
        ))
        .bind(ticker)
        .bind(ticker)
        .bind(min_confidence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_prediction).collect()
    }

    /// Predictions made in `[since, until]` with neither an accuracy record nor an exclusion
    pub async fn unvalidated(&self, since: NaiveDate, until: NaiveDate) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM predictions p
            WHERE p.as_of >= ? AND p.as_of <= ?
              AND NOT EXISTS (SELECT 1 FROM prediction_accuracy a WHERE a.prediction_id = p.id)
              AND NOT EXISTS (SELECT 1 FROM validation_exclusions e WHERE e.prediction_id = p.id)
            ORDER BY p.as_of ASC, p.ticker ASC, p.id ASC
            "#,
            PREDICTION_COLUMNS
        ))
        .bind(format_date(since))
        .bind(format_date(until))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_prediction).collect()
    }

    pub async fn count_since(&self, since: NaiveDate) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM predictions WHERE as_of >= ?")
            .bind(format_date(since))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn row_to_prediction(row: &SqliteRow) -> Result<Prediction> {
    let as_of: String = row.try_get("as_of")?;
    let label: String = row.try_get("label")?;
    let diagnostics: String = row.try_get("diagnostics")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Prediction {
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        as_of: parse_date(&as_of)?,
        model_id: row.try_get("model_id")?,
        label: label.parse::<Direction>()?,
        probability: row.try_get("probability")?,
        confidence: row.try_get("confidence")?,
        ensemble_score: row.try_get("ensemble_score")?,
        input_ref: row.try_get("input_ref")?,
        diagnostics: serde_json::from_str::<Diagnostics>(&diagnostics)?,
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::ml::ModelRegistry;
    use crate::types::{ModelKind, ModelMetrics, TrainingRange};
    use chrono::{TimeZone, Utc};

    async fn setup() -> (Database, tempfile::TempDir, ModelRegistry, PredictionRepository) {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(db.pool().clone(), dir.path());
        let repo = PredictionRepository::new(db.pool().clone());
        (db, dir, registry, repo)
    }

    fn metrics(acc: f64) -> ModelMetrics {
        ModelMetrics {
            holdout_accuracy: Some(acc),
            ..ModelMetrics::default()
        }
    }

    fn range() -> TrainingRange {
        TrainingRange {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }
    }

    fn prediction(id: &str, ticker: &str, day: u32, model_id: &str, confidence: f64) -> Prediction {
        Prediction {
            id: id.into(),
            ticker: ticker.into(),
            as_of: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            model_id: model_id.into(),
            label: Direction::Up,
            probability: 0.7,
            confidence,
            ensemble_score: 0.1,
            input_ref: "window".into(),
            diagnostics: Diagnostics::default(),
            created_at: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_insert_requires_promoted_model() {
        let (_db, _dir, registry, repo) = setup().await;
        let model = registry
            .register(ModelKind::Ensemble, "v1-abc", range(), metrics(0.6), None)
            .await
            .unwrap();

        let p = prediction("p1", "ABC", 4, &model.id, 0.4);
        assert_eq!(repo.insert(&p).await.unwrap(), InsertOutcome::NotPromoted);

        registry.promote_if_better(&model).await.unwrap();
        assert_eq!(repo.insert(&p).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(repo.insert(&p).await.unwrap(), InsertOutcome::AlreadyExists);
        assert_eq!(repo.get("p1").await.unwrap().unwrap(), p);

        let orphan = prediction("p2", "ABC", 4, "no-such-model", 0.4);
        assert_eq!(repo.insert(&orphan).await.unwrap(), InsertOutcome::MissingModel);
    }

    #[tokio::test]
    async fn test_recent_filters_and_unvalidated_window() {
        let (db, _dir, registry, repo) = setup().await;
        let model = registry
            .register(ModelKind::Ensemble, "v1-abc", range(), metrics(0.6), None)
            .await
            .unwrap();
        registry.promote_if_better(&model).await.unwrap();

        for (id, ticker, day, conf) in [("a", "ABC", 4, 0.2), ("b", "ABC", 5, 0.6), ("c", "XYZ", 5, 0.9)] {
            repo.insert(&prediction(id, ticker, day, &model.id, conf)).await.unwrap();
        }

        let abc = repo.recent(Some("ABC"), 0.0, 10).await.unwrap();
        assert_eq!(abc.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
        let confident = repo.recent(None, 0.5, 10).await.unwrap();
        assert_eq!(confident.len(), 2);

        sqlx::query("INSERT INTO validation_exclusions (prediction_id, reason, excluded_at) VALUES ('c', 'stale', '2024-03-20T00:00:00.000000Z')")
            .execute(db.pool())
            .await
            .unwrap();
        let pending = repo
            .unvalidated(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap())
            .await
            .unwrap();
        assert_eq!(pending.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(repo.count_since(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()).await.unwrap(), 2);
    }
}
