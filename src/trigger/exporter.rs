use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::trigger::{ClipExporter, ExportError, ExportOutcome, ExportReport};

const DEFAULT_EXTENSION: &str = "mp4";

/// Copies clips to `{export_dir}/{destination}_{n}.{ext}`, `n` being the
/// clip's position in the batch (oldest first).
pub struct FsClipExporter {
    export_dir: PathBuf,
}

impl FsClipExporter {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self { export_dir: export_dir.into() }
    }

    fn target_for(&self, source: &Path, destination: &str, n: usize) -> PathBuf {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(DEFAULT_EXTENSION);
        self.export_dir.join(format!("{destination}_{n}.{ext}"))
    }
}

#[async_trait::async_trait]
impl ClipExporter for FsClipExporter {
    async fn export(
        &self,
        files: &[PathBuf],
        destination: &str,
    ) -> Result<ExportReport, ExportError> {
        tokio::fs::create_dir_all(&self.export_dir)
            .await
            .map_err(|source| ExportError::CreateDir {
                path: self.export_dir.clone(),
                source,
            })?;

        let mut outcomes = Vec::with_capacity(files.len());
        for (n, source) in files.iter().enumerate() {
            let target = self.target_for(source, destination, n);
            match tokio::fs::copy(source, &target).await {
                Ok(bytes) => {
                    info!(from = %source.display(), to = %target.display(), bytes, "clip exported");
                    outcomes.push(ExportOutcome::ok(source.clone(), target));
                }
                Err(e) => {
                    let err = ExportError::Copy {
                        from: source.clone(),
                        to: target,
                        source: e,
                    };
                    error!(error = %err, "clip export failed");
                    outcomes.push(ExportOutcome::failed(source.clone(), err));
                }
            }
        }

        Ok(ExportReport {
            destination: destination.to_string(),
            outcomes,
        })
    }
}
