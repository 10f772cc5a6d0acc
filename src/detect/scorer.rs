//! Anomaly scoring strategies.
//!
//! Both variants consume the RMS produced by the rolling window and return an
//! [`AnomalyEvent`] per evaluation. The engine only sees [`AnomalyScorer`], so
//! the detection policy can change without touching ingestion or triggering.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::detect::history::ErrorHistory;
use crate::detect::model::Regressor;
use crate::detect::window::RollingWindow;
use crate::detect::{AnomalyEvent, DetectError};

pub trait AnomalyScorer: Send {
    fn name(&self) -> &'static str;

    fn evaluate(&mut self, rms: f32, timestamp_ms: u64) -> AnomalyEvent;

    /// Drop learned state (buffers, error history).
    fn reset(&mut self) {}
}

// ---------------------------------------------------------------------------
// Threshold
// ---------------------------------------------------------------------------

/// Shared, lock-free threshold that can be changed while the scorer runs.
#[derive(Debug, Clone)]
pub struct ThresholdHandle(Arc<AtomicU32>);

impl ThresholdHandle {
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(value.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// `detected = rms > threshold`, no history.
pub struct ThresholdScorer {
    threshold: ThresholdHandle,
}

impl ThresholdScorer {
    pub fn new(threshold: ThresholdHandle) -> Self {
        Self { threshold }
    }

    pub fn handle(&self) -> ThresholdHandle {
        self.threshold.clone()
    }
}

impl AnomalyScorer for ThresholdScorer {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn evaluate(&mut self, rms: f32, timestamp_ms: u64) -> AnomalyEvent {
        let threshold = self.threshold.get();
        AnomalyEvent {
            timestamp_ms,
            detected: rms > threshold,
            rms,
            predicted: None,
            error: None,
            threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// Predictive
// ---------------------------------------------------------------------------

/// Flags an anomaly when the model's prediction error exceeds
/// `mean(errors) + k * stddev(errors)` over the recent error history.
pub struct PredictiveScorer {
    inputs: RollingWindow,
    history: ErrorHistory,
    min_history: usize,
    model: Option<Arc<dyn Regressor>>,
}

impl PredictiveScorer {
    pub fn new(
        input_len: usize,
        history_capacity: usize,
        k: f64,
        min_history: usize,
        model: Option<Arc<dyn Regressor>>,
    ) -> Result<Self, DetectError> {
        if let Some(m) = &model {
            if m.input_len() != input_len {
                return Err(DetectError::ModelShape {
                    expected: m.input_len(),
                    actual: input_len,
                });
            }
        } else {
            warn!("predictive scorer has no model, anomalies will never be reported");
        }

        Ok(Self {
            inputs: RollingWindow::new(input_len)?,
            history: ErrorHistory::new(history_capacity, k),
            min_history: min_history.max(1),
            model,
        })
    }

    pub fn error_history_len(&self) -> usize {
        self.history.len()
    }
}

impl AnomalyScorer for PredictiveScorer {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn evaluate(&mut self, rms: f32, timestamp_ms: u64) -> AnomalyEvent {
        let mut event = AnomalyEvent {
            timestamp_ms,
            rms,
            ..AnomalyEvent::default()
        };

        // Predict from the previous values, then compare with what arrived.
        if self.inputs.is_full() {
            if let Some(model) = &self.model {
                if let Some(predicted) = model.predict(self.inputs.contiguous()) {
                    let error = (predicted - rms).abs();
                    self.history.push(error as f64);
                    let threshold = self.history.threshold();

                    event.predicted = Some(predicted);
                    event.error = Some(error);
                    event.threshold = threshold as f32;
                    event.detected =
                        self.history.len() >= self.min_history && (error as f64) > threshold;

                    trace!(rms, predicted, error, threshold, "predictive evaluation");
                }
            }
        }

        self.inputs.push(rms);
        event
    }

    fn reset(&mut self) {
        self.inputs.reset();
        self.history.clear();
    }
}
