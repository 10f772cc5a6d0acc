//! Monitoring session: sensor -> detector -> trigger coordinator, with the
//! segment timer running alongside.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detect::{Detector, DetectorMetrics, ThresholdHandle, TriggerEvent};
use crate::recorder::{timer, RingController, StopOutcome};
use crate::sensor::{SampleSink, SensorRegistration, SensorSource};
use crate::trigger::{
    run_dispatcher, ClipExporter, TriggerAudit, TriggerCoordinator, TriggerOutcome,
    TriggerSettings,
};

const TRIGGER_CHANNEL: usize = 16;

/// Everything a session needs, built by the caller.
pub struct MonitorParts {
    pub detector: Detector,
    pub threshold: Option<ThresholdHandle>,
    pub sensor: Box<dyn SensorSource>,
    pub controller: RingController,
    pub exporter: Arc<dyn ClipExporter>,
    pub audit: Option<Arc<dyn TriggerAudit>>,
    pub trigger: TriggerSettings,
    pub segment: Duration,
}

pub struct Monitor {
    controller: RingController,
    coordinator: TriggerCoordinator,
    triggers: broadcast::Sender<TriggerEvent>,
    metrics: watch::Receiver<DetectorMetrics>,
    threshold: Option<ThresholdHandle>,
    detection_enabled: bool,
    last_sample_ms: Arc<AtomicU64>,
    finalize_timeout: Duration,
    cancel: CancellationToken,
    registration: tokio::sync::Mutex<Option<SensorRegistration>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    /// Register the sensor and start the segment timer and trigger
    /// dispatcher. Must be called inside a Tokio runtime.
    ///
    /// An unavailable sensor disables detection; recording still runs.
    pub fn start(parts: MonitorParts) -> Self {
        let MonitorParts {
            detector,
            threshold,
            sensor,
            controller,
            exporter,
            audit,
            trigger,
            segment,
        } = parts;

        let cancel = CancellationToken::new();
        let finalize_timeout = trigger.finalize_timeout;
        let (triggers, _) = broadcast::channel(TRIGGER_CHANNEL);
        let (metrics_tx, metrics) = watch::channel(detector.metrics().clone());
        let coordinator = TriggerCoordinator::new(controller.clone(), exporter, audit, trigger);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_dispatcher(
            coordinator.clone(),
            triggers.subscribe(),
            cancel.child_token(),
        )));
        // The first tick fires immediately and starts slot `ring_index`.
        tasks.push(tokio::spawn(timer::run_segment_loop(
            controller.clone(),
            segment,
            finalize_timeout,
            cancel.child_token(),
        )));

        let last_sample_ms = Arc::new(AtomicU64::new(0));
        let sink = detection_sink(detector, metrics_tx, triggers.clone(), last_sample_ms.clone());
        let (registration, detection_enabled) = match sensor.register(sink) {
            Ok(reg) => {
                info!(sensor = sensor.name(), "monitoring started");
                (Some(reg), true)
            }
            Err(e) => {
                warn!(sensor = sensor.name(), error = %e, "sensor unavailable, detection disabled");
                (None, false)
            }
        };

        Self {
            controller,
            coordinator,
            triggers,
            metrics,
            threshold,
            detection_enabled,
            last_sample_ms,
            finalize_timeout,
            cancel,
            registration: tokio::sync::Mutex::new(registration),
            tasks: tokio::sync::Mutex::new(tasks),
        }
    }

    pub fn controller(&self) -> &RingController {
        &self.controller
    }

    pub fn detection_enabled(&self) -> bool {
        self.detection_enabled
    }

    pub fn threshold(&self) -> Option<&ThresholdHandle> {
        self.threshold.as_ref()
    }

    pub fn metrics(&self) -> DetectorMetrics {
        self.metrics.borrow().clone()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<DetectorMetrics> {
        self.metrics.clone()
    }

    pub fn subscribe_triggers(&self) -> broadcast::Receiver<TriggerEvent> {
        self.triggers.subscribe()
    }

    pub fn trigger_in_flight(&self) -> bool {
        self.coordinator.in_flight()
    }

    /// Export the latest clips now. Skips the cooldown gate but not the
    /// single-flight guard.
    pub async fn manual_trigger(&self) -> TriggerOutcome {
        let event = TriggerEvent::manual(self.last_sample_ms.load(Ordering::Relaxed));
        self.coordinator.on_trigger(event).await
    }

    /// Stop detection, let any running export finish, then finalize or
    /// abandon the in-flight segment.
    pub async fn shutdown(&self) -> StopOutcome {
        if let Some(reg) = self.registration.lock().await.take() {
            reg.unregister().await;
        }
        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "monitor task ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + self.finalize_timeout * 2;
        while self.coordinator.in_flight() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.coordinator.in_flight() {
            warn!("shutting down with a trigger export still running");
        }

        let outcome = self.controller.shutdown(self.finalize_timeout).await;
        info!("monitoring stopped");
        outcome
    }
}

fn detection_sink(
    detector: Detector,
    metrics: watch::Sender<DetectorMetrics>,
    triggers: broadcast::Sender<TriggerEvent>,
    last_sample_ms: Arc<AtomicU64>,
) -> SampleSink {
    let detector = Mutex::new(detector);
    Arc::new(move |sample| {
        last_sample_ms.store(sample.timestamp_ms, Ordering::Relaxed);
        let Ok(mut detector) = detector.lock() else {
            return;
        };
        let trigger = detector.ingest(&sample);
        metrics.send_replace(detector.metrics().clone());
        drop(detector);

        if let Some(event) = trigger {
            // No receivers only happens during shutdown.
            let _ = triggers.send(event);
        }
    })
}
