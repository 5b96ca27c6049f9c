use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::TrainingSettings;

#[derive(Debug, Error, PartialEq)]
pub enum EstimatorError {
    #[error("Empty training set")]
    EmptyDataset,

    #[error("Labels contain a single class")]
    SingleClass,

    #[error("Shape mismatch: {rows} rows, {labels} labels")]
    ShapeMismatch { rows: usize, labels: usize },

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),
}

/// Z-score scaling fitted on the training matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl Standardizer {
    pub fn fit(x: &Array2<f64>) -> Result<Self, EstimatorError> {
        let means = x.mean_axis(Axis(0)).ok_or(EstimatorError::EmptyDataset)?;
        let stds = x.std_axis(Axis(0), 0.0);
        Ok(Self {
            means: means.to_vec(),
            stds: stds.to_vec(),
        })
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(j, v)| {
                let std = self.stds.get(j).copied().unwrap_or(0.0);
                if std > 1e-10 {
                    (v - self.means[j]) / std
                } else {
                    0.0
                }
            })
            .collect()
    }
}

fn check_inputs(x: &Array2<f64>, y: &[bool]) -> Result<(), EstimatorError> {
    if x.nrows() == 0 {
        return Err(EstimatorError::EmptyDataset);
    }
    if x.nrows() != y.len() {
        return Err(EstimatorError::ShapeMismatch {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(EstimatorError::NonFinite("features"));
    }
    let ups = y.iter().filter(|l| **l).count();
    if ups == 0 || ups == y.len() {
        return Err(EstimatorError::SingleClass);
    }
    Ok(())
}

/// L2-regularized logistic regression fitted by batch gradient descent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub scaler: Standardizer,
}

impl LogisticModel {
    pub fn fit(x: &Array2<f64>, y: &[bool], settings: &TrainingSettings) -> Result<Self, EstimatorError> {
        check_inputs(x, y)?;
        let scaler = Standardizer::fit(x)?;
        let n = x.nrows();
        let num_features = x.ncols();

        let normalized: Vec<Vec<f64>> = x
            .rows()
            .into_iter()
            .map(|r| scaler.transform(&r.to_vec()))
            .collect();
        let labels: Vec<f64> = y.iter().map(|l| if *l { 1.0 } else { 0.0 }).collect();

        let mut coefficients = vec![0.0; num_features];
        let mut intercept = 0.0;
        let lr = settings.learning_rate;

        for _iter in 0..settings.max_iterations {
            let mut grad_coef = vec![0.0; num_features];
            let mut grad_intercept = 0.0;

            for (row, label) in normalized.iter().zip(&labels) {
                let z = intercept + dot(&coefficients, row);
                let error = sigmoid(z) - label;
                grad_intercept += error;
                for j in 0..num_features {
                    grad_coef[j] += error * row[j];
                }
            }

            intercept -= lr * grad_intercept / n as f64;
            for j in 0..num_features {
                coefficients[j] -= lr * (grad_coef[j] / n as f64 + settings.l2_penalty * coefficients[j]);
            }
        }

        if !intercept.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
            return Err(EstimatorError::NonFinite("coefficients"));
        }

        debug!("Logistic fit: {} samples, {} features", n, num_features);
        Ok(Self {
            coefficients,
            intercept,
            scaler,
        })
    }

    /// Probability the next move is UP
    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        let normalized = self.scaler.transform(row);
        sigmoid(self.intercept + dot(&self.coefficients, &normalized))
    }
}

/// Gaussian naive Bayes over standardized features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianNb {
    pub prior_up: f64,
    pub means: [Vec<f64>; 2],
    pub variances: [Vec<f64>; 2],
    pub scaler: Standardizer,
}

impl GaussianNb {
    const VAR_SMOOTHING: f64 = 1e-6;

    pub fn fit(x: &Array2<f64>, y: &[bool]) -> Result<Self, EstimatorError> {
        check_inputs(x, y)?;
        let scaler = Standardizer::fit(x)?;
        let num_features = x.ncols();

        let mut sums = [vec![0.0; num_features], vec![0.0; num_features]];
        let mut sq_sums = [vec![0.0; num_features], vec![0.0; num_features]];
        let mut counts = [0usize; 2];

        for (row, label) in x.rows().into_iter().zip(y) {
            let normalized = scaler.transform(&row.to_vec());
            let class = usize::from(*label);
            counts[class] += 1;
            for j in 0..num_features {
                sums[class][j] += normalized[j];
                sq_sums[class][j] += normalized[j] * normalized[j];
            }
        }

        let mut means = [vec![0.0; num_features], vec![0.0; num_features]];
        let mut variances = [vec![0.0; num_features], vec![0.0; num_features]];
        for class in 0..2 {
            let n = counts[class] as f64;
            for j in 0..num_features {
                let mean = sums[class][j] / n;
                means[class][j] = mean;
                variances[class][j] = (sq_sums[class][j] / n - mean * mean).max(0.0) + Self::VAR_SMOOTHING;
            }
        }

        Ok(Self {
            prior_up: counts[1] as f64 / y.len() as f64,
            means,
            variances,
            scaler,
        })
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        let normalized = self.scaler.transform(row);
        let log_likelihood = |class: usize| -> f64 {
            normalized
                .iter()
                .enumerate()
                .map(|(j, v)| {
                    let var = self.variances[class][j];
                    -0.5 * ((2.0 * std::f64::consts::PI * var).ln() + (v - self.means[class][j]).powi(2) / var)
                })
                .sum()
        };
        let up = self.prior_up.ln() + log_likelihood(1);
        let down = (1.0 - self.prior_up).ln() + log_likelihood(0);
        // Softmax over the two log-posteriors
        sigmoid(up - down)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Separable data: label is UP when the first feature is positive
    fn separable(n: usize) -> (Array2<f64>, Vec<bool>) {
        let mut x = Array2::<f64>::zeros((n, 2));
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let v = (i as f64 - n as f64 / 2.0) / 10.0 + 0.05;
            x[[i, 0]] = v;
            x[[i, 1]] = (i % 7) as f64;
            y.push(v > 0.0);
        }
        (x, y)
    }

    #[test]
    fn test_logistic_learns_separable_data() {
        let (x, y) = separable(80);
        let model = LogisticModel::fit(&x, &y, &TrainingSettings::default()).unwrap();
        assert!(model.predict_proba(&[3.0, 1.0]) > 0.8);
        assert!(model.predict_proba(&[-3.0, 1.0]) < 0.2);
    }

    #[test]
    fn test_naive_bayes_learns_separable_data() {
        let (x, y) = separable(80);
        let model = GaussianNb::fit(&x, &y).unwrap();
        assert!(model.predict_proba(&[3.0, 1.0]) > 0.8);
        assert!(model.predict_proba(&[-3.0, 1.0]) < 0.2);
    }

    #[test]
    fn test_single_class_is_rejected() {
        let x = Array2::<f64>::ones((10, 2));
        let y = vec![true; 10];
        assert_eq!(LogisticModel::fit(&x, &y, &TrainingSettings::default()), Err(EstimatorError::SingleClass));
        assert_eq!(GaussianNb::fit(&x, &y), Err(EstimatorError::SingleClass));
    }

    #[test]
    fn test_non_finite_features_are_rejected() {
        let (mut x, y) = separable(20);
        x[[3, 1]] = f64::NAN;
        assert_eq!(GaussianNb::fit(&x, &y), Err(EstimatorError::NonFinite("features")));
    }

    #[test]
    fn test_constant_column_does_not_blow_up() {
        let scaler = Standardizer {
            means: vec![1.0, 2.0],
            stds: vec![0.0, 2.0],
        };
        assert_eq!(scaler.transform(&[5.0, 6.0]), vec![0.0, 2.0]);
    }
}
