//! Ring-buffer segment recording.
//!
//! A [`RingController`] owns N slot files and drives an external
//! [`SegmentRecorder`] one segment at a time. The ring index only advances
//! after the recorder confirms a clean finalize, and is persisted through a
//! [`RingIndexStore`] so restarts resume at the right slot.

pub mod command;
pub mod controller;
pub mod slots;
pub mod synthetic;
pub mod timer;

pub use controller::{RingController, RingSnapshot, StartOutcome, StopOutcome};
pub use slots::{RingSlot, SlotTable};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to prepare segment for slot {slot}: {reason}")]
    Prepare { slot: usize, reason: String },

    #[error("failed to start segment for slot {slot}: {reason}")]
    Start { slot: usize, reason: String },

    #[error("slot file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Controller state. At most one slot is in flight at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", content = "slot", rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Recording(usize),
    Stopping(usize),
}

impl RecorderState {
    pub fn is_idle(&self) -> bool {
        matches!(self, RecorderState::Idle)
    }

    pub fn slot(&self) -> Option<usize> {
        match self {
            RecorderState::Idle => None,
            RecorderState::Recording(s) | RecorderState::Stopping(s) => Some(*s),
        }
    }
}

pub type FinalizeResult = Result<(), String>;

/// One-shot completion signal handed to a segment when it starts.
///
/// Dropping it without reporting counts as a failed finalize.
#[derive(Debug)]
pub struct FinalizeNotifier(oneshot::Sender<FinalizeResult>);

impl FinalizeNotifier {
    pub fn channel() -> (Self, oneshot::Receiver<FinalizeResult>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn success(self) {
        let _ = self.0.send(Ok(()));
    }

    pub fn failure(self, reason: impl Into<String>) {
        let _ = self.0.send(Err(reason.into()));
    }

    pub fn report(self, result: FinalizeResult) {
        let _ = self.0.send(result);
    }
}

/// Produces video segments. Naming and slot selection belong to the
/// controller; the recorder only writes bytes to the given path.
#[async_trait::async_trait]
pub trait SegmentRecorder: Send + Sync {
    async fn prepare_segment(
        &self,
        slot: usize,
        path: &Path,
    ) -> Result<Box<dyn SegmentHandle>, RecorderError>;
}

#[async_trait::async_trait]
pub trait SegmentHandle: Send {
    /// Begin writing. `notifier` must be resolved exactly once when the
    /// output is complete or has failed.
    async fn start(&mut self, notifier: FinalizeNotifier) -> Result<(), RecorderError>;

    /// Ask the segment to finalize. Does not wait for completion.
    async fn stop(&mut self);

    /// Force the writer to quit and wait until it has released the output.
    /// Called when a finalize never arrived; the notifier result, if any, is
    /// ignored afterwards.
    async fn abort(&mut self);
}

/// Durable storage for the ring index, keyed by subsystem name.
pub trait RingIndexStore: Send + Sync {
    fn load(&self, name: &str) -> anyhow::Result<Option<usize>>;
    fn save(&self, name: &str, index: usize) -> anyhow::Result<()>;
}

/// Process-local store for tests and `--ephemeral` runs.
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    values: Mutex<HashMap<String, usize>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RingIndexStore for MemoryIndexStore {
    fn load(&self, name: &str) -> anyhow::Result<Option<usize>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("ring index store poisoned"))?;
        Ok(values.get(name).copied())
    }

    fn save(&self, name: &str, index: usize) -> anyhow::Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("ring index store poisoned"))?;
        values.insert(name.to_string(), index);
        Ok(())
    }
}
