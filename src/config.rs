//! TOML configuration for the RoadWatch daemon.
//!
//! Layered: an explicit `--config` path, then the `ROADWATCH_CONFIG`
//! environment variable, then `/etc/roadwatch/roadwatch.toml`, then
//! compiled-in defaults. Every section is optional.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "ROADWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/roadwatch/roadwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoadwatchConfig {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RoadwatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration layers. An explicit path must load.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback", CONFIG_ENV
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.detector.window_size == 0 {
            bail!("detector.window_size must be at least 1");
        }
        if self.detector.predictive.input_len == 0 {
            bail!("detector.predictive.input_len must be at least 1");
        }
        if self.ring.slots == 0 {
            bail!("ring.slots must be at least 1");
        }
        if self.trigger.clip_count == 0 || self.trigger.clip_count > self.ring.slots {
            bail!(
                "trigger.clip_count must be between 1 and ring.slots ({}), got {}",
                self.ring.slots,
                self.trigger.clip_count
            );
        }
        if self.ring.segment_ms == 0 {
            bail!("ring.segment_ms must be greater than zero");
        }
        if self.sensor.rate_hz == 0 {
            bail!("sensor.rate_hz must be greater than zero");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    Threshold,
    Predictive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of gyroscope magnitudes in the RMS window.
    pub window_size: usize,
    /// RMS threshold (rad/s) for the threshold scorer.
    pub threshold: f32,
    pub scorer: ScorerKind,
    pub predictive: PredictiveConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            threshold: 4.0,
            scorer: ScorerKind::Threshold,
            predictive: PredictiveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    /// Length of the RMS sequence fed to the model.
    pub input_len: usize,
    pub error_history: usize,
    /// Threshold multiplier: mean + k * stddev.
    pub k: f64,
    /// Errors required before any detection is reported.
    pub min_error_history: usize,
    /// JSON model file. The embedded default is used when unset.
    pub model_path: Option<PathBuf>,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            input_len: 10,
            error_history: 100,
            k: 2.0,
            min_error_history: 10,
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub cooldown_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { cooldown_ms: 5_000 }
    }
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Number of ring slots.
    pub slots: usize,
    /// Directory holding `{index}.{extension}` slot files.
    pub segment_dir: PathBuf,
    pub extension: String,
    /// Segment length; the timer stops and restarts recording at this cadence.
    pub segment_ms: u64,
    /// Key under which the ring index is persisted.
    pub name: String,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            slots: 6,
            segment_dir: PathBuf::from("data/segments"),
            extension: "mp4".to_string(),
            segment_ms: 5_000,
            name: "dashcam".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderBackend {
    /// Writes placeholder bytes; useful without a camera.
    Synthetic,
    /// Spawns an external capture command per segment.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub backend: RecorderBackend,
    pub program: String,
    /// Arguments; `{output}` is replaced by the slot path.
    pub args: Vec<String>,
    /// Bytes per second written by the synthetic backend.
    pub synthetic_rate: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            backend: RecorderBackend::Synthetic,
            program: "ffmpeg".to_string(),
            args: [
                "-hide_banner", "-loglevel", "error", "-y", "-f", "v4l2", "-i", "/dev/video0",
                "-c:v", "libx264", "-preset", "ultrafast", "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            synthetic_rate: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Finalized segments exported per trigger (K).
    pub clip_count: usize,
    /// Bounded wait for the in-flight segment to finalize.
    pub finalize_timeout_ms: u64,
    pub export_dir: PathBuf,
    /// Restart ring recording after an export if it was running before.
    pub resume_recording: bool,
    /// Hold the single-flight guard this long after an export completes.
    pub settle_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            clip_count: 2,
            finalize_timeout_ms: 3_000,
            export_dir: PathBuf::from("data/trigger_recordings"),
            resume_recording: true,
            settle_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Simulated,
    Replay,
    /// No gyroscope; detection is disabled.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub rate_hz: u32,
    /// CSV file for the replay source.
    pub replay_path: Option<PathBuf>,
    /// Simulated source: a bump every this many milliseconds.
    pub bump_interval_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Simulated,
            rate_hz: 50,
            replay_path: None,
            bump_interval_ms: 20_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage, API, logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/roadwatch.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}
