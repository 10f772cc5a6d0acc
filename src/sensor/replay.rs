//! Replay of recorded gyroscope traces.
//!
//! Format: one `timestamp_ms,x,y,z` record per line. Blank lines, `#`
//! comments and a leading header row are skipped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::detect::SensorSample;
use crate::sensor::{SampleSink, SensorError, SensorRegistration, SensorSource};

pub fn load_replay(path: &Path) -> Result<Vec<SensorSample>, SensorError> {
    let content = std::fs::read_to_string(path).map_err(|source| SensorError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_replay(&content)
}

pub fn parse_replay(content: &str) -> Result<Vec<SensorSample>, SensorError> {
    let mut samples = Vec::new();
    for (i, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(SensorError::Parse {
                line: i + 1,
                reason: format!("expected 4 fields, found {}", fields.len()),
            });
        }
        let Ok(timestamp_ms) = fields[0].parse::<u64>() else {
            if samples.is_empty() && i == 0 {
                continue; // header
            }
            return Err(SensorError::Parse {
                line: i + 1,
                reason: format!("invalid timestamp {:?}", fields[0]),
            });
        };
        let mut axes = [0f32; 3];
        for (axis, field) in axes.iter_mut().zip(&fields[1..]) {
            *axis = field.parse().map_err(|_| SensorError::Parse {
                line: i + 1,
                reason: format!("invalid axis value {field:?}"),
            })?;
        }
        samples.push(SensorSample::new(axes[0], axes[1], axes[2], timestamp_ms));
    }
    Ok(samples)
}

/// Feeds a recorded trace into the detector. When `paced`, samples are
/// spaced by their recorded timestamps; otherwise they are delivered as
/// fast as the sink accepts them.
pub struct ReplaySource {
    path: PathBuf,
    paced: bool,
}

impl ReplaySource {
    pub fn new(path: PathBuf, paced: bool) -> Self {
        Self { path, paced }
    }
}

impl SensorSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn register(&self, sink: SampleSink) -> Result<SensorRegistration, SensorError> {
        let samples = load_replay(&self.path)?;
        if samples.is_empty() {
            return Err(SensorError::Unavailable(format!(
                "replay file {} has no samples",
                self.path.display()
            )));
        }
        info!(
            path = %self.path.display(),
            samples = samples.len(),
            paced = self.paced,
            "replay registered"
        );

        let paced = self.paced;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut previous: Option<u64> = None;
            for sample in samples {
                if token.is_cancelled() {
                    break;
                }
                if paced {
                    let gap = previous.map_or(0, |p| sample.timestamp_ms.saturating_sub(p));
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(gap)) => {}
                    }
                }
                previous = Some(sample.timestamp_ms);
                sink(sample);
            }
            info!("replay finished");
        });

        Ok(SensorRegistration::new(cancel, task))
    }
}
