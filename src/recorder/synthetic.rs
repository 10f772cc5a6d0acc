//! Camera-less recorder that streams filler bytes into the slot file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::recorder::{FinalizeNotifier, RecorderError, SegmentHandle, SegmentRecorder};

const CHUNK_INTERVAL: Duration = Duration::from_millis(100);

pub struct SyntheticRecorder {
    bytes_per_sec: usize,
}

impl SyntheticRecorder {
    pub fn new(bytes_per_sec: usize) -> Self {
        Self { bytes_per_sec }
    }
}

#[async_trait::async_trait]
impl SegmentRecorder for SyntheticRecorder {
    async fn prepare_segment(
        &self,
        slot: usize,
        path: &Path,
    ) -> Result<Box<dyn SegmentHandle>, RecorderError> {
        Ok(Box::new(SyntheticHandle {
            slot,
            path: path.to_path_buf(),
            chunk: (self.bytes_per_sec / 10).max(1),
            stop: CancellationToken::new(),
            task: None,
        }))
    }
}

struct SyntheticHandle {
    slot: usize,
    path: PathBuf,
    chunk: usize,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl SegmentHandle for SyntheticHandle {
    async fn start(&mut self, notifier: FinalizeNotifier) -> Result<(), RecorderError> {
        let mut file = tokio::fs::File::create(&self.path).await?;
        let stop = self.stop.clone();
        let chunk = vec![(self.slot as u8).wrapping_add(b'0'); self.chunk];
        let slot = self.slot;

        self.task = Some(tokio::spawn(async move {
            let result = async {
                let mut ticker = tokio::time::interval(CHUNK_INTERVAL);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => file.write_all(&chunk).await?,
                    }
                }
                file.flush().await?;
                file.sync_all().await
            }
            .await;

            debug!(slot, ok = result.is_ok(), "synthetic segment closed");
            notifier.report(result.map_err(|e| e.to_string()));
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        self.stop.cancel();
    }

    async fn abort(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyntheticHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
