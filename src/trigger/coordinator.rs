use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TriggerConfig;
use crate::detect::TriggerEvent;
use crate::recorder::{RingController, StopOutcome};
use crate::trigger::{ClipExporter, ExportReport, TriggerAudit};

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub clip_count: usize,
    pub finalize_timeout: Duration,
    pub resume_recording: bool,
    pub settle: Duration,
}

impl From<&TriggerConfig> for TriggerSettings {
    fn from(cfg: &TriggerConfig) -> Self {
        Self {
            clip_count: cfg.clip_count,
            finalize_timeout: Duration::from_millis(cfg.finalize_timeout_ms),
            resume_recording: cfg.resume_recording,
            settle: Duration::from_millis(cfg.settle_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// Another trigger was being handled.
    Dropped,
    Completed(ExportReport),
    /// The exporter could not run at all.
    ExportFailed(String),
}

/// Clears the single-flight flag when the trigger finishes, however it ends.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct TriggerCoordinator {
    controller: RingController,
    exporter: Arc<dyn ClipExporter>,
    audit: Option<Arc<dyn TriggerAudit>>,
    settings: TriggerSettings,
    in_flight: Arc<AtomicBool>,
}

impl TriggerCoordinator {
    pub fn new(
        controller: RingController,
        exporter: Arc<dyn ClipExporter>,
        audit: Option<Arc<dyn TriggerAudit>>,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            controller,
            exporter,
            audit,
            settings,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<FlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(self.in_flight.clone()))
    }

    /// Handle one trigger end to end. Returns immediately with
    /// [`TriggerOutcome::Dropped`] if another trigger is in progress.
    pub async fn on_trigger(&self, event: TriggerEvent) -> TriggerOutcome {
        let Some(_guard) = self.try_begin() else {
            warn!(
                ts = event.timestamp_ms,
                source = %event.source,
                "trigger dropped, export already in progress"
            );
            return TriggerOutcome::Dropped;
        };
        info!(ts = event.timestamp_ms, source = %event.source, "trigger accepted");

        let was_active = self.controller.pause().await;
        match self.controller.stop_and_wait(self.settings.finalize_timeout).await {
            StopOutcome::Finalized(slot) => debug!(slot, "segment finalized for export"),
            StopOutcome::Idle => debug!("no segment in flight"),
            // Already logged by the controller; export whatever is complete.
            StopOutcome::Failed(slot) | StopOutcome::TimedOut(slot) => {
                debug!(slot, "in-flight segment not exported")
            }
        }

        let clips: Vec<PathBuf> = self
            .controller
            .latest_finalized(self.settings.clip_count)
            .await
            .into_iter()
            .map(|s| s.path)
            .collect();
        if clips.is_empty() {
            warn!("no finalized segments to export");
        }

        let destination = format!("trigger_{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"));
        let outcome = match self.exporter.export(&clips, &destination).await {
            Ok(report) => {
                info!(
                    %destination,
                    exported = report.exported(),
                    failed = report.failed(),
                    "trigger export complete"
                );
                self.record(event, &report).await;
                TriggerOutcome::Completed(report)
            }
            Err(e) => {
                error!(error = %e, %destination, "trigger export failed");
                TriggerOutcome::ExportFailed(e.to_string())
            }
        };

        if !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }

        let restart = was_active && self.settings.resume_recording;
        match self.controller.resume(restart).await {
            Ok(Some(started)) => debug!(?started, "recording resumed"),
            Ok(None) => debug!("recording left idle after trigger"),
            Err(e) => error!(error = %e, "failed to resume recording"),
        }

        outcome
    }

    /// Write the trigger to the audit log off the async workers.
    async fn record(&self, event: TriggerEvent, report: &ExportReport) {
        let Some(audit) = self.audit.clone() else {
            return;
        };
        let report = report.clone();
        match tokio::task::spawn_blocking(move || audit.record(&event, &report)).await {
            Ok(Ok(id)) => debug!(%id, "trigger recorded"),
            Ok(Err(e)) => error!(error = %e, "failed to record trigger"),
            Err(e) => error!(error = %e, "trigger audit task failed"),
        }
    }
}

/// Forward triggers from the detector to the coordinator. Each trigger runs
/// in its own task so a busy coordinator drops, rather than queues, the
/// next one.
pub async fn run_dispatcher(
    coordinator: TriggerCoordinator,
    mut triggers: broadcast::Receiver<TriggerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = triggers.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "trigger dispatcher lagged, triggers dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.on_trigger(event).await;
        });
    }
    debug!("trigger dispatcher stopped");
}
