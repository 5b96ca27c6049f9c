use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::database::{format_date, format_ts, parse_date, parse_ts};
use crate::error::Result;
use crate::types::{AccuracyRecord, Direction, FeedbackMetric, Insight, MetricStatus};

/// An accuracy record joined with what was predicted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewedOutcome {
    pub record: AccuracyRecord,
    pub predicted: Direction,
    pub probability: f64,
}

/// Correct / total over some window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AccuracyTally {
    pub correct: i64,
    pub total: i64,
}

impl AccuracyTally {
    pub fn accuracy(&self) -> Option<f64> {
        (self.total > 0).then(|| self.correct as f64 / self.total as f64)
    }
}

const ACCURACY_COLUMNS: &str = "a.prediction_id, a.ticker, a.prediction_date, a.verification_date, a.realized_direction, a.price_move, a.is_correct, a.validation_source, a.validated_at";

/// Write-once realized outcomes and validation exclusions
pub struct AccuracyRepository {
    pool: SqlitePool,
}

impl AccuracyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns false if the prediction was already validated
    pub async fn insert(&self, record: &AccuracyRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO prediction_accuracy
                (prediction_id, ticker, prediction_date, verification_date, realized_direction,
                 price_move, is_correct, validation_source, validated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.prediction_id)
        .bind(&record.ticker)
        .bind(format_date(record.prediction_date))
        .bind(format_date(record.verification_date))
        .bind(record.realized_direction.as_str())
        .bind(record.price_move)
        .bind(record.is_correct)
        .bind(&record.validation_source)
        .bind(format_ts(record.validated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark a prediction as permanently unverifiable
    pub async fn exclude(&self, prediction_id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO validation_exclusions (prediction_id, reason, excluded_at) VALUES (?, ?, ?)",
        )
        .bind(prediction_id)
        .bind(reason)
        .bind(format_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, prediction_id: &str) -> Result<Option<AccuracyRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM prediction_accuracy a WHERE a.prediction_id = ?",
            ACCURACY_COLUMNS
        ))
        .bind(prediction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Outcomes verified on `date`, with the predicted label and probability
    pub async fn reviewed_on(&self, date: NaiveDate) -> Result<Vec<ReviewedOutcome>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}, p.label, p.probability FROM prediction_accuracy a
            JOIN predictions p ON p.id = a.prediction_id
            WHERE a.verification_date = ?
            ORDER BY a.ticker, a.prediction_date
            "#,
            ACCURACY_COLUMNS
        ))
        .bind(format_date(date))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ReviewedOutcome> {
                let label: String = row.try_get("label")?;
                Ok(ReviewedOutcome {
                    record: row_to_record(row)?,
                    predicted: label.parse()?,
                    probability: row.try_get("probability")?,
                })
            })
            .collect()
    }

    /// A ticker's outcomes verified in `[since, until]`, oldest first
    pub async fn history(&self, ticker: &str, since: NaiveDate, until: NaiveDate) -> Result<Vec<AccuracyRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM prediction_accuracy a
            WHERE a.ticker = ? AND a.verification_date >= ? AND a.verification_date <= ?
            ORDER BY a.verification_date ASC, a.prediction_date ASC
            "#,
            ACCURACY_COLUMNS
        ))
        .bind(ticker)
        .bind(format_date(since))
        .bind(format_date(until))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Tally over outcomes verified in `[since, until]`
    pub async fn tally_between(&self, since: NaiveDate, until: NaiveDate) -> Result<AccuracyTally> {
        let (correct, total): (Option<i64>, i64) = sqlx::query_as(
            "SELECT SUM(is_correct), COUNT(*) FROM prediction_accuracy WHERE verification_date >= ? AND verification_date <= ?",
        )
        .bind(format_date(since))
        .bind(format_date(until))
        .fetch_one(&self.pool)
        .await?;
        Ok(AccuracyTally {
            correct: correct.unwrap_or(0),
            total,
        })
    }

    /// Per-ticker tallies over outcomes verified in `[since, until]`
    pub async fn tally_by_ticker(&self, since: NaiveDate, until: NaiveDate) -> Result<Vec<(String, AccuracyTally)>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT ticker, SUM(is_correct), COUNT(*) FROM prediction_accuracy
            WHERE verification_date >= ? AND verification_date <= ?
            GROUP BY ticker ORDER BY ticker
            "#,
        )
        .bind(format_date(since))
        .bind(format_date(until))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(ticker, correct, total)| (ticker, AccuracyTally { correct, total }))
            .collect())
    }

    pub async fn exclusion_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM validation_exclusions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn row_to_record(row: &SqliteRow) -> Result<AccuracyRecord> {
    let prediction_date: String = row.try_get("prediction_date")?;
    let verification_date: String = row.try_get("verification_date")?;
    let realized: String = row.try_get("realized_direction")?;
    let validated_at: String = row.try_get("validated_at")?;
    Ok(AccuracyRecord {
        prediction_id: row.try_get("prediction_id")?,
        ticker: row.try_get("ticker")?,
        prediction_date: parse_date(&prediction_date)?,
        verification_date: parse_date(&verification_date)?,
        realized_direction: realized.parse()?,
        price_move: row.try_get("price_move")?,
        is_correct: row.try_get("is_correct")?,
        validation_source: row.try_get("validation_source")?,
        validated_at: parse_ts(&validated_at)?,
    })
}

/// Daily feedback metrics and insights, append-only and idempotent per day
pub struct FeedbackRepository {
    pool: SqlitePool,
}

impl FeedbackRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_metric(&self, metric: &FeedbackMetric) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO feedback_metrics (as_of, metric_name, value, status, details) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(format_date(metric.as_of))
        .bind(&metric.metric_name)
        .bind(metric.value)
        .bind(metric.status.as_str())
        .bind(serde_json::to_string(&metric.details)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_insight(&self, insight: &Insight) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO insights (as_of, scope, category, message, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(format_date(insight.as_of))
        .bind(&insight.scope)
        .bind(&insight.category)
        .bind(&insight.message)
        .bind(format_ts(insight.created_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn metrics_since(&self, since: NaiveDate) -> Result<Vec<FeedbackMetric>> {
        let rows = sqlx::query(
            "SELECT as_of, metric_name, value, status, details FROM feedback_metrics WHERE as_of >= ? ORDER BY as_of DESC, metric_name",
        )
        .bind(format_date(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<FeedbackMetric> {
                let as_of: String = row.try_get("as_of")?;
                let status: String = row.try_get("status")?;
                let details: String = row.try_get("details")?;
                Ok(FeedbackMetric {
                    as_of: parse_date(&as_of)?,
                    metric_name: row.try_get("metric_name")?,
                    value: row.try_get("value")?,
                    status: status.parse::<MetricStatus>()?,
                    details: serde_json::from_str(&details)?,
                })
            })
            .collect()
    }

    pub async fn insights_since(&self, since: NaiveDate) -> Result<Vec<Insight>> {
        let rows = sqlx::query(
            "SELECT as_of, scope, category, message, created_at FROM insights WHERE as_of >= ? ORDER BY as_of DESC, scope, category",
        )
        .bind(format_date(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Insight> {
                let as_of: String = row.try_get("as_of")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(Insight {
                    as_of: parse_date(&as_of)?,
                    scope: row.try_get("scope")?,
                    category: row.try_get("category")?,
                    message: row.try_get("message")?,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn record(id: &str, ticker: &str, verified: u32, correct: bool) -> AccuracyRecord {
        AccuracyRecord {
            prediction_id: id.into(),
            ticker: ticker.into(),
            prediction_date: d(verified - 1),
            verification_date: d(verified),
            realized_direction: Direction::Up,
            price_move: 0.012,
            is_correct: correct,
            validation_source: "close_vs_close".into(),
            validated_at: "2024-03-20T00:00:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_accuracy_record_is_write_once() {
        let db = Database::in_memory().await.unwrap();
        let repo = AccuracyRepository::new(db.pool().clone());
        assert!(repo.insert(&record("p1", "ABC", 5, true)).await.unwrap());

        let mut changed = record("p1", "ABC", 5, false);
        changed.price_move = -0.5;
        assert!(!repo.insert(&changed).await.unwrap());
        assert_eq!(repo.get("p1").await.unwrap().unwrap(), record("p1", "ABC", 5, true));
    }

    #[tokio::test]
    async fn test_tallies_and_history() {
        let db = Database::in_memory().await.unwrap();
        let repo = AccuracyRepository::new(db.pool().clone());
        for (id, ticker, day, ok) in [("a", "ABC", 4, true), ("b", "ABC", 5, false), ("c", "XYZ", 5, true), ("d", "ABC", 6, false)] {
            repo.insert(&record(id, ticker, day, ok)).await.unwrap();
        }

        let all = repo.tally_between(d(1), d(30)).await.unwrap();
        assert_eq!((all.correct, all.total), (2, 4));
        assert_eq!(all.accuracy(), Some(0.5));
        assert_eq!(AccuracyTally::default().accuracy(), None);

        let by_ticker = repo.tally_by_ticker(d(5), d(30)).await.unwrap();
        assert_eq!(by_ticker[0], ("ABC".to_string(), AccuracyTally { correct: 0, total: 2 }));
        assert_eq!(by_ticker[1], ("XYZ".to_string(), AccuracyTally { correct: 1, total: 1 }));

        // Outcomes verified after the upper bound are not counted
        let bounded = repo.tally_between(d(1), d(5)).await.unwrap();
        assert_eq!((bounded.correct, bounded.total), (2, 3));
        let by_ticker = repo.tally_by_ticker(d(5), d(5)).await.unwrap();
        assert_eq!(by_ticker[0], ("ABC".to_string(), AccuracyTally { correct: 0, total: 1 }));

        let history = repo.history("ABC", d(1), d(5)).await.unwrap();
        assert_eq!(history.iter().map(|r| r.prediction_id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_metrics_are_idempotent_per_day() {
        let db = Database::in_memory().await.unwrap();
        let repo = FeedbackRepository::new(db.pool().clone());
        let metric = FeedbackMetric {
            as_of: d(5),
            metric_name: "accuracy".into(),
            value: 0.5,
            status: MetricStatus::Fair,
            details: json!({"records": 4}),
        };
        assert!(repo.insert_metric(&metric).await.unwrap());
        assert!(!repo.insert_metric(&FeedbackMetric { value: 0.9, ..metric.clone() }).await.unwrap());
        assert_eq!(repo.metrics_since(d(1)).await.unwrap(), vec![metric]);

        let insight = Insight {
            as_of: d(5),
            scope: "ABC".into(),
            category: "degradation".into(),
            message: "accuracy fell".into(),
            created_at: "2024-03-05T12:00:00Z".parse().unwrap(),
        };
        assert!(repo.insert_insight(&insight).await.unwrap());
        assert!(!repo.insert_insight(&insight).await.unwrap());
        assert_eq!(repo.insights_since(d(5)).await.unwrap(), vec![insight]);
    }
}
