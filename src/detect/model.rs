//! Frozen sequence-to-scalar regressors for the predictive scorer.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::detect::DetectError;

// Embedded default so the predictive scorer works without a model file.
const DEFAULT_MODEL_JSON: &str = include_str!("rms_ar.json");

/// Predicts the next RMS value from the previous `input_len()` values.
pub trait Regressor: Send + Sync {
    fn input_len(&self) -> usize;

    /// `None` when the input cannot be scored (wrong length, non-finite output).
    fn predict(&self, sequence: &[f32]) -> Option<f32>;
}

/// Linear autoregressive model: `bias + sum(w[i] * x[i])`, oldest input first.
#[derive(Debug, Clone, Deserialize)]
pub struct LinearRegressor {
    #[serde(default)]
    pub name: String,
    pub weights: Vec<f32>,
    #[serde(default)]
    pub bias: f32,
}

impl LinearRegressor {
    pub fn embedded() -> Result<Self, DetectError> {
        Self::from_json(DEFAULT_MODEL_JSON, "<embedded>")
    }

    pub fn load(path: &Path) -> Result<Self, DetectError> {
        let content = fs::read_to_string(path).map_err(|e| DetectError::ModelLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let model = Self::from_json(&content, &path.display().to_string())?;
        info!(
            path = %path.display(),
            name = %model.name,
            inputs = model.weights.len(),
            "loaded RMS model"
        );
        Ok(model)
    }

    fn from_json(content: &str, origin: &str) -> Result<Self, DetectError> {
        let model: Self = serde_json::from_str(content).map_err(|e| DetectError::ModelLoad {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        if model.weights.is_empty() {
            return Err(DetectError::ModelLoad {
                path: origin.to_string(),
                reason: "model has no weights".to_string(),
            });
        }
        Ok(model)
    }
}

impl Regressor for LinearRegressor {
    fn input_len(&self) -> usize {
        self.weights.len()
    }

    fn predict(&self, sequence: &[f32]) -> Option<f32> {
        if sequence.len() != self.weights.len() {
            return None;
        }
        let y = self
            .weights
            .iter()
            .zip(sequence)
            .fold(self.bias, |acc, (w, x)| acc + w * x);
        y.is_finite().then_some(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_model_sanity() {
        let model = LinearRegressor::embedded().unwrap();
        assert_eq!(model.input_len(), 10);
        let sum: f32 = model.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_constant_input_predicts_constant() {
        let model = LinearRegressor::embedded().unwrap();
        let y = model.predict(&[2.0; 10]).unwrap();
        assert!((y - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_wrong_length_is_unscorable() {
        let model = LinearRegressor::embedded().unwrap();
        assert_eq!(model.predict(&[1.0; 3]), None);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = LinearRegressor::load(Path::new("does/not/exist.json")).unwrap_err();
        assert!(matches!(err, DetectError::ModelLoad { .. }));
    }
}
