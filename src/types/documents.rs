//! JSON documents stored alongside feature windows, predictions and model versions.
//!
//! Known entry kinds are tagged variants; anything else goes in `extra`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Qualitative tags attached to a feature window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhilosophyFlag {
    HoldUntilProfitable,
    TrendAligned,
    ElevatedVolatility,
    Oversold,
    Overbought,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextEntry {
    /// Last-row value of one indicator and its z-score within the window
    IndicatorContribution {
        indicator: String,
        value: f64,
        zscore: f64,
    },
    /// Trailing price statistics over the window
    PriceSummary {
        first_close: f64,
        last_close: f64,
        period_return_pct: f64,
        observations: usize,
    },
    Philosophy {
        flag: PhilosophyFlag,
        rationale: String,
    },
    ConfigSource {
        config_version: i64,
    },
    /// Latest news aggregate known on the window date
    NewsSentiment {
        as_of: NaiveDate,
        article_count: i64,
        avg_sentiment: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        buzz_score: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volatility: Option<f64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub entries: Vec<ContextEntry>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ContextDocument {
    pub fn push(&mut self, entry: ContextEntry) {
        self.entries.push(entry);
    }

    pub fn flags(&self) -> Vec<PhilosophyFlag> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                ContextEntry::Philosophy { flag, .. } => Some(*flag),
                _ => None,
            })
            .collect()
    }

    pub fn sentiment(&self) -> Option<f64> {
        self.entries.iter().find_map(|e| match e {
            ContextEntry::NewsSentiment { avg_sentiment, .. } => Some(*avg_sentiment),
            _ => None,
        })
    }

    pub fn contribution(&self, name: &str) -> Option<f64> {
        self.entries.iter().find_map(|e| match e {
            ContextEntry::IndicatorContribution { indicator, value, .. } if indicator == name => {
                Some(*value)
            }
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticEntry {
    Bounds {
        raw_probability: f64,
        bounded_probability: f64,
        floor: f64,
        ceiling: f64,
        clamped: bool,
    },
    ModelContribution {
        model: String,
        probability: f64,
        weight: f64,
    },
    FeatureSource {
        feature_id: String,
        feature_version: String,
        window_as_of: NaiveDate,
    },
    ConfigSnapshot {
        config_version: i64,
        up_threshold: f64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub entries: Vec<DiagnosticEntry>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Diagnostics {
    pub fn push(&mut self, entry: DiagnosticEntry) {
        self.entries.push(entry);
    }

    pub fn was_clamped(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, DiagnosticEntry::Bounds { clamped: true, .. }))
    }

    pub fn contributions(&self) -> Vec<(&str, f64, f64)> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                DiagnosticEntry::ModelContribution {
                    model,
                    probability,
                    weight,
                } => Some((model.as_str(), *probability, *weight)),
                _ => None,
            })
            .collect()
    }
}

/// Evaluation results recorded with every registered model version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMetrics {
    pub train_accuracy: Option<f64>,
    pub holdout_accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub brier_score: Option<f64>,
    pub train_samples: usize,
    pub holdout_samples: usize,
    pub tickers: Vec<String>,
    /// Set when training or evaluation failed; such versions are never promoted
    pub failure: Option<String>,
}

impl ModelMetrics {
    pub fn failed(reason: impl Into<String>, train_samples: usize, tickers: Vec<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            train_samples,
            tickers,
            ..Default::default()
        }
    }

    /// Score used for promotion decisions (held-out accuracy)
    pub fn evaluation_score(&self) -> Option<f64> {
        if self.failure.is_some() {
            return None;
        }
        self.holdout_accuracy.filter(|s| s.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_round_trips_unknown_keys() {
        let json = r#"{"entries":[{"kind":"philosophy","flag":"oversold","rationale":"rsi 22"}],"extra":{"note":"manual"}}"#;
        let doc: ContextDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.flags(), vec![PhilosophyFlag::Oversold]);
        assert_eq!(doc.extra.get("note"), Some(&Value::from("manual")));
    }

    #[test]
    fn test_failed_metrics_have_no_score() {
        let mut m = ModelMetrics::failed("singular", 10, vec![]);
        m.holdout_accuracy = Some(0.9);
        assert!(m.evaluation_score().is_none());
    }

    #[test]
    fn test_diagnostics_clamp_flag() {
        let mut d = Diagnostics::default();
        d.push(DiagnosticEntry::Bounds {
            raw_probability: 0.99,
            bounded_probability: 0.95,
            floor: 0.05,
            ceiling: 0.95,
            clamped: true,
        });
        assert!(d.was_clamped());
        assert!(d.contributions().is_empty());
    }
}
