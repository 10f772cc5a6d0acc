//! Segment recorder backed by an external capture process (e.g. ffmpeg).
//!
//! Stop writes `q` to the process's stdin; a zero exit status is a clean
//! finalize. Processes that ignore the request are killed after a grace
//! period and reported as failed. The grace period must stay below the
//! controller's finalize timeout, see [`stop_grace_for`].

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::recorder::{FinalizeNotifier, RecorderError, SegmentHandle, SegmentRecorder};

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Grace period for a capture process to exit after stop, kept at two
/// thirds of `finalize_timeout` so an unresponsive process is killed
/// before the controller gives up on the segment.
pub fn stop_grace_for(finalize_timeout: Duration) -> Duration {
    finalize_timeout * 2 / 3
}

pub struct CommandRecorder {
    program: String,
    args: Vec<String>,
    stop_grace: Duration,
}

impl CommandRecorder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    fn render_args(&self, output: &Path) -> Vec<String> {
        let output = output.display().to_string();
        self.args
            .iter()
            .map(|a| a.replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }
}

#[async_trait::async_trait]
impl SegmentRecorder for CommandRecorder {
    async fn prepare_segment(
        &self,
        slot: usize,
        path: &Path,
    ) -> Result<Box<dyn SegmentHandle>, RecorderError> {
        if !self.args.iter().any(|a| a.contains(OUTPUT_PLACEHOLDER)) {
            return Err(RecorderError::Prepare {
                slot,
                reason: format!("recorder args do not contain {OUTPUT_PLACEHOLDER}"),
            });
        }
        let mut command = Command::new(&self.program);
        command
            .args(self.render_args(path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        Ok(Box::new(CommandHandle {
            slot,
            command: Some(command),
            stdin: None,
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            stop_grace: self.stop_grace,
            task: None,
        }))
    }
}

struct CommandHandle {
    slot: usize,
    command: Option<Command>,
    stdin: Option<ChildStdin>,
    stop: CancellationToken,
    kill: CancellationToken,
    stop_grace: Duration,
    task: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl SegmentHandle for CommandHandle {
    async fn start(&mut self, notifier: FinalizeNotifier) -> Result<(), RecorderError> {
        let slot = self.slot;
        let mut command = self.command.take().ok_or_else(|| RecorderError::Start {
            slot,
            reason: "segment already started".to_string(),
        })?;
        let mut child = command.spawn().map_err(|e| RecorderError::Start {
            slot,
            reason: e.to_string(),
        })?;
        self.stdin = child.stdin.take();

        let stop = self.stop.clone();
        let kill = self.kill.clone();
        let grace = self.stop_grace;
        self.task = Some(tokio::spawn(async move {
            let stop_expired = async {
                stop.cancelled().await;
                tokio::time::sleep(grace).await;
            };
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop_expired => None,
                _ = kill.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    warn!(slot, "capture process did not exit, killing");
                    // `kill` also reaps the process.
                    if let Err(e) = child.kill().await {
                        warn!(slot, error = %e, "failed to kill capture process");
                    }
                    notifier.failure("capture process killed before finalize");
                    return;
                }
            };

            match status {
                Ok(s) if s.success() => notifier.success(),
                Ok(s) => notifier.failure(format!("capture process exited with {s}")),
                Err(e) => notifier.failure(format!("failed to wait for capture process: {e}")),
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.write_all(b"q\n").await {
                debug!(slot = self.slot, error = %e, "capture process stdin closed");
            }
            // Dropping stdin closes the pipe, which also ends most encoders.
        }
        self.stop.cancel();
    }

    async fn abort(&mut self) {
        self.stdin.take();
        self.kill.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(slot = self.slot, error = %e, "capture task ended abnormally");
            }
        }
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
