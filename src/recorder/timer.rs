use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::recorder::{RingController, StartOutcome, StopOutcome};

/// Periodic segment driver: on every tick, finalize the current segment and
/// start the next one. Runs until `cancel` fires.
pub async fn run_segment_loop(
    controller: RingController,
    segment: Duration,
    finalize_timeout: Duration,
    cancel: CancellationToken,
) {
    info!(segment_ms = segment.as_millis() as u64, "segment timer started");

    let mut interval = tokio::time::interval(segment);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match controller.stop_and_wait(finalize_timeout).await {
            StopOutcome::Idle | StopOutcome::Finalized(_) => {}
            // Failures and timeouts are logged by the controller.
            StopOutcome::Failed(slot) | StopOutcome::TimedOut(slot) => {
                debug!(slot, "segment will be retried");
            }
        }

        match controller.start().await {
            Ok(StartOutcome::Started(_)) => {}
            Ok(other) => debug!(?other, "segment start skipped"),
            Err(e) => error!(error = %e, "failed to start segment"),
        }
    }

    info!("segment timer stopped");
}
