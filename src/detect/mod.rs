//! Motion anomaly detection: rolling RMS window, pluggable scorers, cooldown gate.

pub mod engine;
pub mod gate;
pub mod history;
pub mod model;
pub mod scorer;
pub mod window;

pub use engine::{Detector, DetectorMetrics};
pub use gate::DebouncedGate;
pub use scorer::{AnomalyScorer, PredictiveScorer, ThresholdHandle, ThresholdScorer};
pub use window::RollingWindow;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("window capacity must be at least 1")]
    ZeroWindow,

    #[error("model expects {expected} inputs, scorer buffer holds {actual}")]
    ModelShape { expected: usize, actual: usize },

    #[error("failed to load model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },
}

/// One gyroscope reading (rad/s on each axis).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SensorSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Monotonic timestamp in milliseconds.
    pub timestamp_ms: u64,
}

impl SensorSample {
    pub fn new(x: f32, y: f32, z: f32, timestamp_ms: u64) -> Self {
        Self { x, y, z, timestamp_ms }
    }

    /// Euclidean norm of the three axes.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Result of one scorer evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct AnomalyEvent {
    pub timestamp_ms: u64,
    pub detected: bool,
    pub rms: f32,
    /// Model prediction (predictive scorer only).
    pub predicted: Option<f32>,
    /// |predicted - rms| (predictive scorer only).
    pub error: Option<f32>,
    /// Threshold the decision was made against.
    pub threshold: f32,
}

/// A debounced anomaly, at most one per cooldown window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TriggerEvent {
    pub timestamp_ms: u64,
    pub source: TriggerSource,
}

impl TriggerEvent {
    pub fn detected(timestamp_ms: u64) -> Self {
        Self { timestamp_ms, source: TriggerSource::Detector }
    }

    pub fn manual(timestamp_ms: u64) -> Self {
        Self { timestamp_ms, source: TriggerSource::Manual }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Detector,
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Detector => write!(f, "detector"),
            TriggerSource::Manual => write!(f, "manual"),
        }
    }
}
