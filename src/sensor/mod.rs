//! Gyroscope sources. A source pushes samples into a sink callback from its
//! own task until the registration is dropped or unregistered.

pub mod replay;
pub mod simulated;

pub use replay::{load_replay, ReplaySource};
pub use simulated::SimulatedGyro;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{SensorConfig, SensorKind};
use crate::detect::SensorSample;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read replay file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed replay line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

pub type SampleSink = Arc<dyn Fn(SensorSample) + Send + Sync>;

pub trait SensorSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start delivering samples to `sink`. Must be called inside a Tokio
    /// runtime.
    fn register(&self, sink: SampleSink) -> Result<SensorRegistration, SensorError>;
}

/// Live subscription to a sensor. Dropping it stops delivery.
#[derive(Debug)]
pub struct SensorRegistration {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SensorRegistration {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task: Some(task) }
    }

    /// Stop delivery and wait for the feeding task to exit.
    pub async fn unregister(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "sensor task ended abnormally");
            }
        }
    }

    /// Wait for the source to run out of samples (replay) without
    /// cancelling it.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SensorRegistration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Stand-in for hardware without a gyroscope.
pub struct NoSensor;

impl SensorSource for NoSensor {
    fn name(&self) -> &'static str {
        "none"
    }

    fn register(&self, _sink: SampleSink) -> Result<SensorRegistration, SensorError> {
        Err(SensorError::Unavailable("no gyroscope configured".into()))
    }
}

pub fn build_source(cfg: &SensorConfig) -> Box<dyn SensorSource> {
    match cfg.kind {
        SensorKind::Simulated => Box::new(SimulatedGyro::new(cfg.rate_hz, cfg.bump_interval_ms)),
        SensorKind::Replay => match &cfg.replay_path {
            Some(path) => Box::new(ReplaySource::new(path.clone(), true)),
            None => Box::new(NoSensor),
        },
        SensorKind::None => Box::new(NoSensor),
    }
}
