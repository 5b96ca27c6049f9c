use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use super::ModelArtifact;
use crate::database::{format_date, format_ts, parse_date, parse_opt_ts, parse_ts};
use crate::error::{PipelineError, Result};
use crate::types::{ModelKind, ModelMetrics, ModelVersionRecord, PromotionKey, TrainingRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionAction {
    Promote,
    Demote,
}

impl PromotionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionAction::Promote => "promote",
            PromotionAction::Demote => "demote",
        }
    }
}

/// Audit row for every change of the promotion pointer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionEvent {
    pub model_id: String,
    pub key: PromotionKey,
    pub action: PromotionAction,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PromotionDecision {
    Promoted {
        replaced: Option<String>,
    },
    KeptIncumbent {
        incumbent: String,
        incumbent_score: Option<f64>,
        candidate_score: f64,
    },
    Ineligible {
        reason: String,
    },
}

impl PromotionDecision {
    pub fn label(&self) -> &'static str {
        match self {
            PromotionDecision::Promoted { .. } => "promoted",
            PromotionDecision::KeptIncumbent { .. } => "kept_incumbent",
            PromotionDecision::Ineligible { .. } => "ineligible",
        }
    }
}

const VERSION_COLUMNS: &str = "id, model_kind, training_start, training_end, feature_version, metrics, artifact_ref, created_at, promoted_at";

/// Append-only model version registry with an exclusive promotion pointer per key
pub struct ModelRegistry {
    pool: SqlitePool,
    models_dir: PathBuf,
    promotion_locks: Mutex<HashMap<PromotionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ModelRegistry {
    pub fn new(pool: SqlitePool, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            models_dir: models_dir.into(),
            promotion_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn artifact_path(&self, kind: ModelKind, id: &str) -> PathBuf {
        self.models_dir.join(format!("{}_{}.json", kind.as_str(), id))
    }

    fn key_lock(&self, key: &PromotionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.promotion_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.clone()).or_default().clone()
    }

    /// Record a new, unpromoted version. Failed candidates pass `artifact = None`.
    pub async fn register(
        &self,
        kind: ModelKind,
        feature_version: &str,
        training_range: TrainingRange,
        metrics: ModelMetrics,
        artifact: Option<&ModelArtifact>,
    ) -> Result<ModelVersionRecord> {
        let id = Uuid::new_v4().to_string();
        let artifact_ref = match artifact {
            Some(artifact) => {
                std::fs::create_dir_all(&self.models_dir)?;
                let path = self.artifact_path(kind, &id);
                std::fs::write(&path, artifact.to_json()?)?;
                path.display().to_string()
            }
            None => String::new(),
        };

        let record = ModelVersionRecord {
            id,
            kind,
            training_range,
            feature_version: feature_version.to_string(),
            metrics,
            artifact_ref,
            created_at: Utc::now(),
            promoted_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO model_versions
                (id, model_kind, training_start, training_end, feature_version, metrics, artifact_ref, created_at, promoted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(format_date(record.training_range.start))
        .bind(format_date(record.training_range.end))
        .bind(&record.feature_version)
        .bind(serde_json::to_string(&record.metrics)?)
        .bind(&record.artifact_ref)
        .bind(format_ts(record.created_at))
        .execute(&self.pool)
        .await?;

        info!(
            "Registered {} model {} (score {:?}, failure {:?})",
            record.key(),
            record.id,
            record.metrics.evaluation_score(),
            record.metrics.failure
        );
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ModelVersionRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM model_versions WHERE id = ?", VERSION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_version).transpose()
    }

    /// Every version for a key, newest first
    pub async fn list(&self, key: &PromotionKey) -> Result<Vec<ModelVersionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM model_versions WHERE model_kind = ? AND feature_version = ? ORDER BY created_at DESC",
            VERSION_COLUMNS
        ))
        .bind(key.kind.as_str())
        .bind(&key.feature_version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_version).collect()
    }

    /// The active version for a key. More than one is a fatal inconsistency.
    pub async fn promoted(&self, key: &PromotionKey) -> Result<Option<ModelVersionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM model_versions WHERE model_kind = ? AND feature_version = ? AND promoted_at IS NOT NULL",
            VERSION_COLUMNS
        ))
        .bind(key.kind.as_str())
        .bind(&key.feature_version)
        .fetch_all(&self.pool)
        .await?;

        let mut versions = rows.iter().map(row_to_version).collect::<Result<Vec<_>>>()?;
        if versions.len() > 1 {
            return Err(PipelineError::RegistryInconsistency {
                key: key.to_string(),
                detail: format!("{} promoted versions", versions.len()),
                records: versions.into_iter().map(|v| v.id).collect(),
            });
        }
        Ok(versions.pop())
    }

    /// All currently promoted versions, across keys
    pub async fn all_promoted(&self) -> Result<Vec<ModelVersionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM model_versions WHERE promoted_at IS NOT NULL ORDER BY model_kind, feature_version",
            VERSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_version).collect()
    }

    pub fn load_artifact(&self, record: &ModelVersionRecord) -> Result<ModelArtifact> {
        if record.artifact_ref.is_empty() {
            return Err(PipelineError::Corrupt(format!("model {} has no artifact", record.id)));
        }
        let json = std::fs::read_to_string(&record.artifact_ref)?;
        Ok(ModelArtifact::from_json(&json)?)
    }

    /// Promote `candidate` only if its evaluation score strictly beats the incumbent's
    pub async fn promote_if_better(&self, candidate: &ModelVersionRecord) -> Result<PromotionDecision> {
        let Some(candidate_score) = candidate.metrics.evaluation_score() else {
            return Ok(PromotionDecision::Ineligible {
                reason: candidate
                    .metrics
                    .failure
                    .clone()
                    .unwrap_or_else(|| "no evaluation score".to_string()),
            });
        };

        let key = candidate.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let incumbents = promoted_in_tx(&mut tx, &key).await?;
        if incumbents.len() > 1 {
            return Err(PipelineError::RegistryInconsistency {
                key: key.to_string(),
                detail: format!("{} promoted versions", incumbents.len()),
                records: incumbents.into_iter().map(|v| v.id).collect(),
            });
        }

        let incumbent = incumbents.into_iter().next();
        if let Some(current) = &incumbent {
            let incumbent_score = current.metrics.evaluation_score();
            let beats = incumbent_score.map_or(true, |s| candidate_score > s);
            if current.id == candidate.id || !beats {
                tx.rollback().await?;
                info!(
                    "Keeping {} incumbent {} ({:?}) over {} ({:.4})",
                    key, current.id, incumbent_score, candidate.id, candidate_score
                );
                return Ok(PromotionDecision::KeptIncumbent {
                    incumbent: current.id.clone(),
                    incumbent_score,
                    candidate_score,
                });
            }
        }

        let reason = format!("score {:.4} beats incumbent", candidate_score);
        let replaced = swap_in_tx(&mut tx, &key, incumbent.as_ref().map(|v| v.id.as_str()), &candidate.id, &reason).await?;
        tx.commit().await?;

        info!("Promoted {} model {} (score {:.4}, replaced {:?})", key, candidate.id, candidate_score, replaced);
        Ok(PromotionDecision::Promoted { replaced })
    }

    /// Force the promotion pointer to a specific version (rollback)
    pub async fn promote_specific(&self, id: &str, reason: &str) -> Result<PromotionDecision> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::Corrupt(format!("unknown model version {}", id)))?;
        if record.artifact_ref.is_empty() {
            return Ok(PromotionDecision::Ineligible {
                reason: "version has no artifact".to_string(),
            });
        }

        let key = record.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let incumbents = promoted_in_tx(&mut tx, &key).await?;
        if incumbents.len() > 1 {
            return Err(PipelineError::RegistryInconsistency {
                key: key.to_string(),
                detail: format!("{} promoted versions", incumbents.len()),
                records: incumbents.into_iter().map(|v| v.id).collect(),
            });
        }
        let current = incumbents.into_iter().next();
        if current.as_ref().map(|v| v.id.as_str()) == Some(id) {
            tx.rollback().await?;
            return Ok(PromotionDecision::Promoted { replaced: None });
        }

        let replaced = swap_in_tx(&mut tx, &key, current.as_ref().map(|v| v.id.as_str()), id, reason).await?;
        tx.commit().await?;
        warn!("Forced promotion of {} model {}: {}", key, id, reason);
        Ok(PromotionDecision::Promoted { replaced })
    }

    /// Promotion audit trail for a key, oldest first
    pub async fn promotion_history(&self, key: &PromotionKey) -> Result<Vec<PromotionEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT model_id, model_kind, feature_version, action, reason, at FROM promotion_events
            WHERE model_kind = ? AND feature_version = ?
            ORDER BY id ASC
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.feature_version)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let action: String = row.try_get("action")?;
                let at: String = row.try_get("at")?;
                Ok(PromotionEvent {
                    model_id: row.try_get("model_id")?,
                    key: key.clone(),
                    action: if action == "promote" {
                        PromotionAction::Promote
                    } else {
                        PromotionAction::Demote
                    },
                    reason: row.try_get("reason")?,
                    at: parse_ts(&at)?,
                })
            })
            .collect()
    }

    /// Latest training range end across all versions, if any
    pub async fn latest_training_end(&self) -> Result<Option<NaiveDate>> {
        let row = sqlx::query("SELECT MAX(training_end) AS end FROM model_versions")
            .fetch_one(&self.pool)
            .await?;
        let end: Option<String> = row.try_get("end")?;
        end.as_deref().map(parse_date).transpose()
    }
}

async fn promoted_in_tx(tx: &mut Transaction<'_, Sqlite>, key: &PromotionKey) -> Result<Vec<ModelVersionRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM model_versions WHERE model_kind = ? AND feature_version = ? AND promoted_at IS NOT NULL",
        VERSION_COLUMNS
    ))
    .bind(key.kind.as_str())
    .bind(&key.feature_version)
    .fetch_all(&mut **tx)
    .await?;
    rows.iter().map(row_to_version).collect()
}

/// Demote-then-promote inside `tx`. Each UPDATE is a compare-and-swap on `promoted_at`.
async fn swap_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    key: &PromotionKey,
    incumbent: Option<&str>,
    candidate: &str,
    reason: &str,
) -> Result<Option<String>> {
    let now = format_ts(Utc::now());

    if let Some(old) = incumbent {
        let demoted = sqlx::query("UPDATE model_versions SET promoted_at = NULL WHERE id = ? AND promoted_at IS NOT NULL")
            .bind(old)
            .execute(&mut **tx)
            .await?;
        if demoted.rows_affected() != 1 {
            return Err(PipelineError::RegistryInconsistency {
                key: key.to_string(),
                detail: "incumbent changed during promotion".to_string(),
                records: vec![old.to_string(), candidate.to_string()],
            });
        }
        record_event(tx, key, old, PromotionAction::Demote, &format!("superseded by {}", candidate), &now).await?;
    }

    let promoted = sqlx::query("UPDATE model_versions SET promoted_at = ? WHERE id = ? AND promoted_at IS NULL")
        .bind(&now)
        .bind(candidate)
        .execute(&mut **tx)
        .await?;
    if promoted.rows_affected() != 1 {
        return Err(PipelineError::RegistryInconsistency {
            key: key.to_string(),
            detail: "candidate could not be promoted".to_string(),
            records: vec![candidate.to_string()],
        });
    }
    record_event(tx, key, candidate, PromotionAction::Promote, reason, &now).await?;

    Ok(incumbent.map(str::to_string))
}

async fn record_event(
    tx: &mut Transaction<'_, Sqlite>,
    key: &PromotionKey,
    model_id: &str,
    action: PromotionAction,
    reason: &str,
    at: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO promotion_events (model_id, model_kind, feature_version, action, reason, at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(model_id)
    .bind(key.kind.as_str())
    .bind(&key.feature_version)
    .bind(action.as_str())
    .bind(reason)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_version(row: &SqliteRow) -> Result<ModelVersionRecord> {
    let kind: String = row.try_get("model_kind")?;
    let start: String = row.try_get("training_start")?;
    let end: String = row.try_get("training_end")?;
    let metrics: String = row.try_get("metrics")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ModelVersionRecord {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        training_range: TrainingRange {
            start: parse_date(&start)?,
            end: parse_date(&end)?,
        },
        feature_version: row.try_get("feature_version")?,
        metrics: serde_json::from_str(&metrics)?,
        artifact_ref: row.try_get("artifact_ref")?,
        created_at: parse_ts(&created_at)?,
        promoted_at: parse_opt_ts(row.try_get("promoted_at")?)?,
    })
}
