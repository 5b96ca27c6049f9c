use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::{PredictionSettings, Settings};
use crate::database::{format_ts, parse_ts};
use crate::error::Result;
use crate::features::{FeatureParams, IndicatorToggles};

/// Parameter overrides written by feedback (or an operator) on top of static settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability_floor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability_ceiling: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicators: Option<IndicatorToggles>,
}

/// Immutable parameter set a run executes against. Version 0 is the static baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: i64,
    pub parent_version: Option<i64>,
    pub overrides: ConfigOverrides,
    pub source: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn baseline() -> Self {
        Self {
            version: 0,
            parent_version: None,
            overrides: ConfigOverrides::default(),
            source: "baseline".to_string(),
            reason: "static settings".to_string(),
            created_at: DateTime::<Utc>::default(),
        }
    }

    pub fn feature_params(&self, base: &FeatureParams) -> FeatureParams {
        let mut params = base.clone();
        if let Some(len) = self.overrides.window_length {
            params.window_length = len;
        }
        if let Some(toggles) = &self.overrides.indicators {
            params.indicators = toggles.clone();
        }
        params
    }

    pub fn up_threshold(&self, base: &PredictionSettings) -> f64 {
        self.overrides.up_threshold.unwrap_or(base.up_threshold)
    }

    /// (floor, ceiling) for probability guardrails
    pub fn bounds(&self, base: &PredictionSettings) -> (f64, f64) {
        (
            self.overrides.probability_floor.unwrap_or(base.probability_floor),
            self.overrides.probability_ceiling.unwrap_or(base.probability_ceiling),
        )
    }

    /// Active feature version under this snapshot
    pub fn feature_version(&self, settings: &Settings) -> String {
        self.feature_params(&settings.features).version()
    }
}

/// Append-only store of config snapshots
pub struct ConfigRepository {
    pool: SqlitePool,
}

impl ConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn latest(&self) -> Result<ConfigSnapshot> {
        let row = sqlx::query(
            "SELECT version, parent_version, overrides, source, reason, created_at
             FROM config_snapshots ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_snapshot(&row),
            None => Ok(ConfigSnapshot::baseline()),
        }
    }

    pub async fn get(&self, version: i64) -> Result<Option<ConfigSnapshot>> {
        if version == 0 {
            return Ok(Some(ConfigSnapshot::baseline()));
        }
        let row = sqlx::query(
            "SELECT version, parent_version, overrides, source, reason, created_at
             FROM config_snapshots WHERE version = ?",
        )
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_snapshot).transpose()
    }

    pub async fn find_by_source(&self, source: &str) -> Result<Option<ConfigSnapshot>> {
        let row = sqlx::query(
            "SELECT version, parent_version, overrides, source, reason, created_at
             FROM config_snapshots WHERE source = ?",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_snapshot).transpose()
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<ConfigSnapshot>> {
        let rows = sqlx::query(
            "SELECT version, parent_version, overrides, source, reason, created_at
             FROM config_snapshots ORDER BY version DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_snapshot).collect()
    }

    /// Derive a new version from the latest one. Returns None if `source` was already used.
    pub async fn append(
        &self,
        overrides: &ConfigOverrides,
        source: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ConfigSnapshot>> {
        let overrides_json = serde_json::to_string(overrides)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO config_snapshots
                (version, parent_version, overrides, source, reason, created_at)
            SELECT COALESCE(MAX(version), 0) + 1, COALESCE(MAX(version), 0), ?, ?, ?, ?
            FROM config_snapshots
            "#,
        )
        .bind(&overrides_json)
        .bind(source)
        .bind(reason)
        .bind(format_ts(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let snapshot = self.find_by_source(source).await?;
        if let Some(s) = &snapshot {
            info!("Config snapshot v{} written by {}: {}", s.version, source, reason);
        }
        Ok(snapshot)
    }
}

fn row_to_snapshot(row: &SqliteRow) -> Result<ConfigSnapshot> {
    let overrides: String = row.try_get("overrides")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ConfigSnapshot {
        version: row.try_get("version")?,
        parent_version: row.try_get("parent_version")?,
        overrides: serde_json::from_str(&overrides)?,
        source: row.try_get("source")?,
        reason: row.try_get("reason")?,
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn test_empty_store_yields_baseline() {
        let db = Database::in_memory().await.unwrap();
        let repo = ConfigRepository::new(db.pool().clone());
        let latest = repo.latest().await.unwrap();
        assert_eq!(latest.version, 0);
        assert_eq!(latest.up_threshold(&PredictionSettings::default()), 0.5);
    }

    #[tokio::test]
    async fn test_append_chains_versions_and_rejects_duplicate_source() {
        let db = Database::in_memory().await.unwrap();
        let repo = ConfigRepository::new(db.pool().clone());
        let now = Utc::now();

        let first = ConfigOverrides {
            up_threshold: Some(0.45),
            ..Default::default()
        };
        let v1 = repo.append(&first, "feedback:2024-03-04", "low accuracy", now).await.unwrap().unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.parent_version, Some(0));

        let again = repo.append(&first, "feedback:2024-03-04", "low accuracy", now).await.unwrap();
        assert!(again.is_none());

        let second = ConfigOverrides {
            up_threshold: Some(0.40),
            ..Default::default()
        };
        let v2 = repo.append(&second, "feedback:2024-03-05", "low accuracy", now).await.unwrap().unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.parent_version, Some(1));

        // Earlier versions are untouched
        let old = repo.get(1).await.unwrap().unwrap();
        assert_eq!(old.overrides.up_threshold, Some(0.45));
        assert_eq!(repo.latest().await.unwrap().version, 2);
    }

    #[test]
    fn test_window_override_changes_feature_version() {
        let settings = Settings::default();
        let mut snapshot = ConfigSnapshot::baseline();
        let base_version = snapshot.feature_version(&settings);
        snapshot.overrides.window_length = Some(40);
        assert_ne!(snapshot.feature_version(&settings), base_version);
    }
}
