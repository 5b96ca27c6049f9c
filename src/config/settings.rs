use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::features::FeatureParams;
use crate::types::ModelKind;

const DEFAULTS: &str = include_str!("defaults.toml");

/// Static settings, layered: built-in defaults -> optional file -> `NEXTGEN__SECTION__KEY` env.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub pipeline: PipelineSettings,
    pub features: FeatureParams,
    pub training: TrainingSettings,
    pub prediction: PredictionSettings,
    pub validation: ValidationSettings,
    pub feedback: FeedbackSettings,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml));

        if let Some(path) = path {
            info!("Loading settings from {}", path.display());
            builder = builder.add_source(::config::File::from(path).required(false));
        }

        let settings: Settings = builder
            .add_source(
                ::config::Environment::with_prefix("NEXTGEN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings
            .validate()
            .map_err(|errors| PipelineError::Config(errors.join("; ")))?;
        Ok(settings)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = self.features.validate();

        // Pipeline
        if self.pipeline.max_workers == 0 {
            errors.push("pipeline.max_workers must be > 0".to_string());
        }
        if self.pipeline.cycle_deadline_secs == 0 {
            errors.push("pipeline.cycle_deadline_secs must be > 0".to_string());
        }

        // Training
        if self.training.model_kinds.is_empty() {
            errors.push("training.model_kinds must not be empty".to_string());
        }
        if self.training.holdout_fraction <= 0.0 || self.training.holdout_fraction >= 1.0 {
            errors.push("training.holdout_fraction must be between 0 and 1".to_string());
        }
        if self.training.min_training_samples < 2 {
            errors.push("training.min_training_samples must be >= 2".to_string());
        }
        if self.training.max_training_samples < self.training.min_training_samples {
            errors.push("training.max_training_samples must be >= min_training_samples".to_string());
        }
        if self.training.learning_rate <= 0.0 {
            errors.push("training.learning_rate must be > 0".to_string());
        }

        // Prediction
        let p = &self.prediction;
        if !(0.0..0.5).contains(&p.probability_floor) || !(0.5..=1.0).contains(&p.probability_ceiling) {
            errors.push("prediction: floor must be in [0, 0.5) and ceiling in [0.5, 1]".to_string());
        }
        if p.up_threshold <= 0.0 || p.up_threshold >= 1.0 {
            errors.push("prediction.up_threshold must be between 0 and 1".to_string());
        }

        // Validation
        if self.validation.horizon_sessions == 0 {
            errors.push("validation.horizon_sessions must be > 0".to_string());
        }
        if self.validation.max_staleness_days <= 0 {
            errors.push("validation.max_staleness_days must be > 0".to_string());
        }
        if self.validation.max_staleness_days >= self.validation.lookback_days {
            // Otherwise a pending prediction leaves the candidate window before it can expire
            errors.push("validation.max_staleness_days must be < lookback_days".to_string());
        }

        // Feedback
        let f = &self.feedback;
        if f.min_records == 0 {
            errors.push("feedback.min_records must be > 0".to_string());
        }
        if f.threshold_min > f.threshold_max {
            errors.push("feedback: threshold_min must be <= threshold_max".to_string());
        }
        if f.streak_saturation == 0 {
            errors.push("feedback.streak_saturation must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Effective settings as TOML
    pub fn render(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./data/pipeline.db".to_string(),
            data_dir: PathBuf::from("./data"),
            models_dir: PathBuf::from("./data/models"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Empty means every ticker present in the market data
    pub universe: Vec<String>,
    pub max_workers: usize,
    pub cycle_deadline_secs: u64,
    /// Full-batch training runs inside a cycle when the last one is older than this
    pub training_interval_days: i64,
    pub http_port: u16,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            universe: Vec::new(),
            max_workers: 4,
            cycle_deadline_secs: 900,
            training_interval_days: 7,
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub model_kinds: Vec<ModelKind>,
    pub holdout_fraction: f64,
    pub min_training_samples: usize,
    pub max_training_samples: usize,
    pub learning_rate: f64,
    pub max_iterations: usize,
    pub l2_penalty: f64,
    pub claim_timeout_mins: i64,
    pub max_signals_per_run: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            model_kinds: vec![ModelKind::Logistic, ModelKind::Ensemble],
            holdout_fraction: 0.2,
            min_training_samples: 30,
            max_training_samples: 5000,
            learning_rate: 0.1,
            max_iterations: 500,
            l2_penalty: 0.01,
            claim_timeout_mins: 60,
            max_signals_per_run: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionSettings {
    pub model_kind: ModelKind,
    pub up_threshold: f64,
    pub probability_floor: f64,
    pub probability_ceiling: f64,
    pub max_window_age_days: i64,
    pub max_model_age_days: i64,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            model_kind: ModelKind::Ensemble,
            up_threshold: 0.5,
            probability_floor: 0.05,
            probability_ceiling: 0.95,
            max_window_age_days: 5,
            max_model_age_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub horizon_sessions: usize,
    pub max_staleness_days: i64,
    /// How far back to look for unvalidated predictions
    pub lookback_days: i64,
    pub rolling_window_days: i64,
    pub source: String,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            horizon_sessions: 1,
            max_staleness_days: 10,
            lookback_days: 30,
            rolling_window_days: 30,
            source: "close_vs_close".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackSettings {
    pub accuracy_threshold: f64,
    pub lookback_days: i64,
    pub min_records: usize,
    pub streak_saturation: usize,
    pub lower_below: f64,
    pub raise_above: f64,
    pub threshold_step_down: f64,
    pub threshold_step_up: f64,
    pub threshold_min: f64,
    pub threshold_max: f64,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            accuracy_threshold: 0.4,
            lookback_days: 10,
            min_records: 3,
            streak_saturation: 5,
            lower_below: 0.4,
            raise_above: 0.7,
            threshold_step_down: 0.05,
            threshold_step_up: 0.01,
            threshold_min: 0.3,
            threshold_max: 0.7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults_match_default_impl() {
        let loaded = Settings::load(None).unwrap();
        assert_eq!(loaded.features, FeatureParams::default());
        assert_eq!(loaded.prediction, PredictionSettings::default());
        assert_eq!(loaded.feedback, FeedbackSettings::default());
        assert_eq!(loaded.training, TrainingSettings::default());
        assert_eq!(loaded.validation, ValidationSettings::default());
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[features]\nwindow_length = 30\n\n[pipeline]\nuniverse = [\"ABC\", \"XYZ\"]").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.features.window_length, 30);
        assert_eq!(settings.features.sma_slow, 20);
        assert_eq!(settings.pipeline.universe, vec!["ABC", "XYZ"]);
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut settings = Settings::default();
        settings.pipeline.max_workers = 0;
        settings.validation.horizon_sessions = 0;
        settings.prediction.probability_floor = 0.6;
        let errors = settings.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_staleness_must_fit_inside_lookback() {
        let mut settings = Settings::default();
        settings.validation.lookback_days = 10;
        settings.validation.max_staleness_days = 10;
        let errors = settings.validate().unwrap_err();
        assert_eq!(errors, vec!["validation.max_staleness_days must be < lookback_days".to_string()]);

        settings.validation.max_staleness_days = 9;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_render_is_valid_toml() {
        let rendered = Settings::default().render().unwrap();
        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, Settings::default());
    }
}
