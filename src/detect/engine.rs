use std::sync::Arc;

use tracing::{info, trace, warn};

use crate::config::{DetectorConfig, GateConfig, ScorerKind};
use crate::detect::gate::DebouncedGate;
use crate::detect::model::{LinearRegressor, Regressor};
use crate::detect::scorer::{AnomalyScorer, PredictiveScorer, ThresholdHandle, ThresholdScorer};
use crate::detect::window::RollingWindow;
use crate::detect::{AnomalyEvent, DetectError, SensorSample, TriggerEvent};

/// Snapshot of detector state for downstream observers.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DetectorMetrics {
    pub scorer: &'static str,
    pub samples: u64,
    pub evaluations: u64,
    pub triggers: u64,
    pub window_ready: bool,
    pub last_evaluation: Option<AnomalyEvent>,
    pub last_trigger_ms: Option<u64>,
}

/// Sample ingestion path: magnitude -> rolling RMS -> scorer -> gate.
///
/// Each `ingest` is a fixed amount of work bounded by the window sizes.
pub struct Detector {
    window: RollingWindow,
    scorer: Box<dyn AnomalyScorer>,
    gate: DebouncedGate,
    metrics: DetectorMetrics,
}

impl Detector {
    pub fn new(
        window_size: usize,
        scorer: Box<dyn AnomalyScorer>,
        cooldown_ms: u64,
    ) -> Result<Self, DetectError> {
        let metrics = DetectorMetrics {
            scorer: scorer.name(),
            ..DetectorMetrics::default()
        };
        Ok(Self {
            window: RollingWindow::new(window_size)?,
            scorer,
            gate: DebouncedGate::new(cooldown_ms),
            metrics,
        })
    }

    /// Build from configuration. Returns the threshold handle when the
    /// threshold scorer is selected.
    ///
    /// A missing or malformed model does not fail construction: the
    /// predictive scorer runs without one and never reports detections.
    pub fn from_config(
        detector: &DetectorConfig,
        gate: &GateConfig,
    ) -> Result<(Self, Option<ThresholdHandle>), DetectError> {
        let (scorer, handle): (Box<dyn AnomalyScorer>, _) = match detector.scorer {
            ScorerKind::Threshold => {
                let handle = ThresholdHandle::new(detector.threshold);
                (Box::new(ThresholdScorer::new(handle.clone())), Some(handle))
            }
            ScorerKind::Predictive => {
                let p = &detector.predictive;
                let model = load_model(p.model_path.as_deref());
                let scorer = match PredictiveScorer::new(
                    p.input_len,
                    p.error_history,
                    p.k,
                    p.min_error_history,
                    model,
                ) {
                    Ok(s) => s,
                    Err(e @ DetectError::ModelShape { .. }) => {
                        warn!(error = %e, "model unusable, predictive scorer disabled");
                        PredictiveScorer::new(
                            p.input_len,
                            p.error_history,
                            p.k,
                            p.min_error_history,
                            None,
                        )?
                    }
                    Err(e) => return Err(e),
                };
                (Box::new(scorer), None)
            }
        };

        info!(
            scorer = scorer.name(),
            window = detector.window_size,
            cooldown_ms = gate.cooldown_ms,
            "detector configured"
        );
        Ok((Self::new(detector.window_size, scorer, gate.cooldown_ms)?, handle))
    }

    pub fn ingest(&mut self, sample: &SensorSample) -> Option<TriggerEvent> {
        self.metrics.samples += 1;

        let rms = self.window.push(sample.magnitude())?;
        self.metrics.window_ready = true;

        let event = self.scorer.evaluate(rms, sample.timestamp_ms);
        self.metrics.evaluations += 1;
        self.metrics.last_evaluation = Some(event);
        trace!(ts = sample.timestamp_ms, rms, detected = event.detected, "evaluated");

        let trigger = self.gate.on_evaluation(&event)?;
        self.metrics.triggers += 1;
        self.metrics.last_trigger_ms = Some(trigger.timestamp_ms);
        info!(ts = trigger.timestamp_ms, rms, threshold = event.threshold, "pothole detected");
        Some(trigger)
    }

    pub fn metrics(&self) -> &DetectorMetrics {
        &self.metrics
    }

    /// Clear window, scorer and gate state; counters are kept.
    pub fn reset(&mut self) {
        self.window.reset();
        self.scorer.reset();
        self.gate.reset();
        self.metrics.window_ready = false;
    }
}

fn load_model(path: Option<&std::path::Path>) -> Option<Arc<dyn Regressor>> {
    let loaded = match path {
        Some(p) => LinearRegressor::load(p),
        None => LinearRegressor::embedded(),
    };
    match loaded {
        Ok(model) => Some(Arc::new(model)),
        Err(e) => {
            warn!(error = %e, "RMS model unavailable");
            None
        }
    }
}
