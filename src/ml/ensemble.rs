use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::estimators::{EstimatorError, GaussianNb, LogisticModel};
use crate::config::TrainingSettings;
use crate::types::ModelKind;

/// Ensemble member weights
const LOGISTIC_WEIGHT: f64 = 0.6;
const NAIVE_BAYES_WEIGHT: f64 = 0.4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "estimator", rename_all = "snake_case")]
pub enum Estimator {
    Logistic(LogisticModel),
    GaussianNb(GaussianNb),
}

impl Estimator {
    pub fn name(&self) -> &'static str {
        match self {
            Estimator::Logistic(_) => "logistic",
            Estimator::GaussianNb(_) => "gaussian_nb",
        }
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        match self {
            Estimator::Logistic(m) => m.predict_proba(row),
            Estimator::GaussianNb(m) => m.predict_proba(row),
        }
    }
}

/// Model with its ensemble weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedEstimator {
    pub estimator: Estimator,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberOutput {
    pub name: &'static str,
    pub probability: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleOutput {
    /// Weighted mean of member probabilities
    pub probability: f64,
    /// Twice the weighted std of member probabilities, in [0, 1]
    pub diversity: f64,
    pub members: Vec<MemberOutput>,
}

/// Serialized form of a trained model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub kind: ModelKind,
    pub feature_version: String,
    pub feature_columns: Vec<String>,
    pub members: Vec<WeightedEstimator>,
}

impl ModelArtifact {
    pub fn train(
        kind: ModelKind,
        feature_version: &str,
        feature_columns: Vec<String>,
        x: &Array2<f64>,
        y: &[bool],
        settings: &TrainingSettings,
    ) -> Result<Self, EstimatorError> {
        let logistic = Estimator::Logistic(LogisticModel::fit(x, y, settings)?);
        let members = match kind {
            ModelKind::Logistic => vec![WeightedEstimator {
                estimator: logistic,
                weight: 1.0,
            }],
            ModelKind::Ensemble => vec![
                WeightedEstimator {
                    estimator: logistic,
                    weight: LOGISTIC_WEIGHT,
                },
                WeightedEstimator {
                    estimator: Estimator::GaussianNb(GaussianNb::fit(x, y)?),
                    weight: NAIVE_BAYES_WEIGHT,
                },
            ],
        };

        info!("Trained {} artifact with {} member(s) on {} samples", kind, members.len(), x.nrows());
        Ok(Self {
            kind,
            feature_version: feature_version.to_string(),
            feature_columns,
            members,
        })
    }

    pub fn score(&self, row: &[f64]) -> EnsembleOutput {
        let members: Vec<MemberOutput> = self
            .members
            .iter()
            .map(|m| MemberOutput {
                name: m.estimator.name(),
                probability: m.estimator.predict_proba(row),
                weight: m.weight,
            })
            .filter(|m| m.probability.is_finite())
            .collect();

        let total_weight: f64 = members.iter().map(|m| m.weight).sum();
        if total_weight <= 0.0 {
            debug!("No usable ensemble members, returning neutral probability");
            return EnsembleOutput {
                probability: 0.5,
                diversity: 1.0,
                members,
            };
        }

        let probability = members.iter().map(|m| m.probability * m.weight).sum::<f64>() / total_weight;
        let variance = members
            .iter()
            .map(|m| m.weight * (m.probability - probability).powi(2))
            .sum::<f64>()
            / total_weight;
        let diversity = (2.0 * variance.sqrt()).clamp(0.0, 1.0);

        EnsembleOutput {
            probability,
            diversity,
            members,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
