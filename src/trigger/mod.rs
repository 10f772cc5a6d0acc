//! Trigger handling: turn a detected anomaly into exported clips.
//!
//! The [`TriggerCoordinator`] pauses the ring, waits for the in-flight
//! segment to finalize, hands the latest K segments to a [`ClipExporter`]
//! and resumes recording. Only one trigger runs at a time; anything that
//! arrives meanwhile is dropped.

pub mod coordinator;
pub mod exporter;

pub use coordinator::{run_dispatcher, TriggerCoordinator, TriggerOutcome, TriggerSettings};
pub use exporter::FsClipExporter;

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::detect::TriggerEvent;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to create export directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of exporting one segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportOutcome {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub error: Option<String>,
}

impl ExportOutcome {
    pub fn ok(source: PathBuf, target: PathBuf) -> Self {
        Self { source, target: Some(target), error: None }
    }

    pub fn failed(source: PathBuf, error: impl ToString) -> Self {
        Self { source, target: None, error: Some(error.to_string()) }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportReport {
    pub destination: String,
    pub outcomes: Vec<ExportOutcome>,
}

impl ExportReport {
    pub fn exported(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.exported()
    }
}

/// Copies finalized segments somewhere durable.
///
/// Per-file failures belong in the report; `Err` means nothing could be
/// attempted at all.
#[async_trait::async_trait]
pub trait ClipExporter: Send + Sync {
    async fn export(
        &self,
        files: &[PathBuf],
        destination: &str,
    ) -> Result<ExportReport, ExportError>;
}

/// Record of completed triggers.
pub trait TriggerAudit: Send + Sync {
    fn record(&self, event: &TriggerEvent, report: &ExportReport) -> anyhow::Result<Uuid>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let report = ExportReport {
            destination: "trigger_x".into(),
            outcomes: vec![
                ExportOutcome::ok("a".into(), "b".into()),
                ExportOutcome::failed("c".into(), "boom"),
                ExportOutcome::ok("d".into(), "e".into()),
            ],
        };
        assert_eq!(report.exported(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(ExportReport::default().failed(), 0);
    }
}
