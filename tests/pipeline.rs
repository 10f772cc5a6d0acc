//! End-to-end behaviour of detector, ring controller and trigger coordinator
//! wired together with in-memory collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roadwatch::detect::{Detector, SensorSample, ThresholdHandle, ThresholdScorer};
use roadwatch::monitor::{Monitor, MonitorParts};
use roadwatch::recorder::{
    FinalizeNotifier, MemoryIndexStore, RecorderError, RecorderState, RingController,
    RingIndexStore, SegmentHandle, SegmentRecorder, SlotTable, StartOutcome, StopOutcome,
};
use roadwatch::sensor::{NoSensor, SampleSink, SensorError, SensorRegistration, SensorSource};
use roadwatch::storage::{open_pool, SqliteIndexStore};
use roadwatch::trigger::{
    ClipExporter, ExportError, ExportOutcome, ExportReport, TriggerCoordinator, TriggerOutcome,
    TriggerSettings,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Test collaborators
// ----------------------------------------------------------------------------

/// Finalizes on stop by writing a marker file.
#[derive(Default)]
struct InstantRecorder {
    prepared: AtomicUsize,
}

struct InstantHandle {
    path: PathBuf,
    notifier: Option<FinalizeNotifier>,
}

#[async_trait::async_trait]
impl SegmentRecorder for InstantRecorder {
    async fn prepare_segment(
        &self,
        _slot: usize,
        path: &Path,
    ) -> Result<Box<dyn SegmentHandle>, RecorderError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InstantHandle {
            path: path.to_path_buf(),
            notifier: None,
        }))
    }
}

#[async_trait::async_trait]
impl SegmentHandle for InstantHandle {
    async fn start(&mut self, notifier: FinalizeNotifier) -> Result<(), RecorderError> {
        self.notifier = Some(notifier);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(n) = self.notifier.take() {
            match std::fs::write(&self.path, b"segment") {
                Ok(()) => n.success(),
                Err(e) => n.failure(e.to_string()),
            }
        }
    }

    async fn abort(&mut self) {
        self.notifier.take();
    }
}

#[derive(Default)]
struct CountingExporter {
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<PathBuf>>>,
    gate: Option<Arc<Notify>>,
}

#[async_trait::async_trait]
impl ClipExporter for CountingExporter {
    async fn export(
        &self,
        files: &[PathBuf],
        destination: &str,
    ) -> Result<ExportReport, ExportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(files.to_vec());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(ExportReport {
            destination: destination.to_string(),
            outcomes: files
                .iter()
                .map(|f| ExportOutcome::ok(f.clone(), PathBuf::from("/exported")))
                .collect(),
        })
    }
}

/// Pushes a fixed list of samples after a short delay.
struct ScriptedSensor {
    samples: Vec<SensorSample>,
    delay: Duration,
}

impl SensorSource for ScriptedSensor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn register(&self, sink: SampleSink) -> Result<SensorRegistration, SensorError> {
        let samples = self.samples.clone();
        let delay = self.delay;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for sample in samples {
                sink(sample);
            }
        });
        Ok(SensorRegistration::new(cancel, task))
    }
}

fn settings(k: usize) -> TriggerSettings {
    TriggerSettings {
        clip_count: k,
        finalize_timeout: Duration::from_secs(2),
        resume_recording: true,
        settle: Duration::ZERO,
    }
}

fn ring(dir: &Path, n: usize, recorder: Arc<dyn SegmentRecorder>) -> RingController {
    RingController::with_slots(
        "dashcam".into(),
        SlotTable::new(dir, "mp4", n),
        0,
        recorder,
        Arc::new(MemoryIndexStore::new()),
    )
}

fn threshold_detector(window: usize, threshold: f32, cooldown_ms: u64) -> Detector {
    let scorer = ThresholdScorer::new(ThresholdHandle::new(threshold));
    Detector::new(window, Box::new(scorer), cooldown_ms).unwrap()
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn test_constant_jolt_triggers_once_per_cooldown() {
    let mut detector = threshold_detector(10, 4.0, 5_000);
    let at = |ts: u64| SensorSample::new(5.0, 0.0, 0.0, ts);

    // Ten samples fill the window; the first evaluation fires.
    let fired: Vec<u64> = (0..10)
        .filter_map(|i| detector.ingest(&at(i * 100)))
        .map(|t| t.timestamp_ms)
        .collect();
    assert_eq!(fired, vec![900]);
    let eval = detector.metrics().last_evaluation.unwrap();
    assert!((eval.rms - 5.0).abs() < 1e-5);
    assert!(eval.detected);

    // Five more inside the cooldown: nothing.
    for i in 10..15 {
        assert!(detector.ingest(&at(i * 100)).is_none());
    }

    // Once 5 s have passed since the first trigger, the next detection fires.
    assert!(detector.ingest(&at(5_800)).is_none());
    let second = detector.ingest(&at(5_900)).unwrap();
    assert_eq!(second.timestamp_ms, 5_900);
    assert_eq!(detector.metrics().triggers, 2);
}

#[tokio::test]
async fn test_trigger_after_wraparound_exports_latest_two() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = ring(dir.path(), 6, Arc::new(InstantRecorder::default()));

    // Eight segments: slots 0,1,2,3,4,5,0,1.
    for i in 0..8 {
        assert_eq!(ctl.start().await.unwrap(), StartOutcome::Started(i % 6));
        assert_eq!(ctl.stop_and_wait(Duration::from_secs(1)).await, StopOutcome::Finalized(i % 6));
    }

    let exporter = Arc::new(CountingExporter::default());
    let coord = TriggerCoordinator::new(ctl.clone(), exporter.clone(), None, settings(2));
    let outcome = coord.on_trigger(roadwatch::detect::TriggerEvent::detected(0)).await;

    assert!(matches!(outcome, TriggerOutcome::Completed(_)));
    let batches = exporter.batches.lock().unwrap();
    assert_eq!(
        batches[0],
        vec![dir.path().join("0.mp4"), dir.path().join("1.mp4")]
    );
}

#[tokio::test]
async fn test_concurrent_trigger_leaves_exporter_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = ring(dir.path(), 6, Arc::new(InstantRecorder::default()));
    let gate = Arc::new(Notify::new());
    let exporter = Arc::new(CountingExporter {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let coord = TriggerCoordinator::new(ctl.clone(), exporter.clone(), None, settings(2));

    ctl.start().await.unwrap();
    let first = tokio::spawn({
        let coord = coord.clone();
        async move { coord.on_trigger(roadwatch::detect::TriggerEvent::detected(1)).await }
    });
    while exporter.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = coord.on_trigger(roadwatch::detect::TriggerEvent::detected(2)).await;
    assert_eq!(second, TriggerOutcome::Dropped);
    assert_eq!(exporter.calls.load(Ordering::SeqCst), 1);

    gate.notify_one();
    first.await.unwrap();
    assert_eq!(exporter.calls.load(Ordering::SeqCst), 1);
    // Recording resumed in the next slot.
    assert_eq!(ctl.state(), RecorderState::Recording(1));
}

#[tokio::test]
async fn test_back_to_back_starts_create_one_writer() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(InstantRecorder::default());
    let ctl = ring(dir.path(), 6, recorder.clone());

    let results = spawn_starts(ctl.clone()).await;
    let started = results
        .iter()
        .filter(|o| matches!(o, StartOutcome::Started(_)))
        .count();
    assert_eq!(started, 1);
    assert_eq!(recorder.prepared.load(Ordering::SeqCst), 1);
}

async fn spawn_starts(ctl: RingController) -> Vec<StartOutcome> {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.start().await.unwrap() })
        })
        .collect();
    let mut out = Vec::new();
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

#[tokio::test]
async fn test_ring_index_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("roadwatch.db");
    let segments = dir.path().join("segments");
    let cfg = roadwatch::config::RingConfig {
        slots: 6,
        segment_dir: segments.clone(),
        extension: "mp4".into(),
        ..Default::default()
    };

    {
        let store = Arc::new(SqliteIndexStore::new(open_pool(db.to_str().unwrap()).unwrap()));
        let ctl = RingController::open(&cfg, Arc::new(InstantRecorder::default()), store).unwrap();
        for _ in 0..3 {
            ctl.start().await.unwrap();
            ctl.stop_and_wait(Duration::from_secs(1)).await;
        }
    }

    let store = Arc::new(SqliteIndexStore::new(open_pool(db.to_str().unwrap()).unwrap()));
    assert_eq!(store.load(&cfg.name).unwrap(), Some(3));
    let ctl = RingController::open(&cfg, Arc::new(InstantRecorder::default()), store).unwrap();
    assert_eq!(ctl.ring_index().await, 3);
    let finalized: Vec<usize> = ctl.latest_finalized(6).await.iter().map(|s| s.index).collect();
    assert_eq!(finalized, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_missing_sensor_keeps_recording() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = ring(dir.path(), 4, Arc::new(InstantRecorder::default()));
    let monitor = Monitor::start(MonitorParts {
        detector: threshold_detector(10, 4.0, 5_000),
        threshold: None,
        sensor: Box::new(NoSensor),
        controller: ctl.clone(),
        exporter: Arc::new(CountingExporter::default()),
        audit: None,
        trigger: settings(2),
        segment: Duration::from_secs(60),
    });

    assert!(!monitor.detection_enabled());
    let mut state = ctl.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, RecorderState::Recording(_))),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(monitor.shutdown().await, StopOutcome::Finalized(0));
    assert!(ctl.state().is_idle());
}

#[tokio::test]
async fn test_export_finishing_after_shutdown_does_not_restart_recording() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = ring(dir.path(), 4, Arc::new(InstantRecorder::default()));
    let gate = Arc::new(Notify::new());
    let exporter = Arc::new(CountingExporter {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let monitor = Arc::new(Monitor::start(MonitorParts {
        detector: threshold_detector(10, 4.0, 5_000),
        threshold: None,
        sensor: Box::new(NoSensor),
        controller: ctl.clone(),
        exporter: exporter.clone(),
        audit: None,
        trigger: TriggerSettings {
            finalize_timeout: Duration::from_millis(200),
            ..settings(2)
        },
        segment: Duration::from_secs(60),
    }));

    let mut state = ctl.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, RecorderState::Recording(_))),
    )
    .await
    .unwrap()
    .unwrap();

    let trigger = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.manual_trigger().await }
    });
    while exporter.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    monitor.shutdown().await;
    assert!(ctl.state().is_idle());

    // The export completes after shutdown and tries to resume recording.
    gate.notify_one();
    assert!(matches!(trigger.await.unwrap(), TriggerOutcome::Completed(_)));
    assert!(ctl.state().is_idle());
    assert_eq!(ctl.start().await.unwrap(), StartOutcome::Closed);
}

#[tokio::test]
async fn test_detected_pothole_exports_clips() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = ring(dir.path(), 6, Arc::new(InstantRecorder::default()));
    let exporter = Arc::new(CountingExporter::default());

    let samples: Vec<SensorSample> = (0..10)
        .map(|i| SensorSample::new(0.0, 5.0, 0.0, i * 20))
        .collect();
    let monitor = Monitor::start(MonitorParts {
        detector: threshold_detector(10, 4.0, 5_000),
        threshold: None,
        // Give the segment timer time to open slot 0 first.
        sensor: Box::new(ScriptedSensor {
            samples,
            delay: Duration::from_millis(100),
        }),
        controller: ctl.clone(),
        exporter: exporter.clone(),
        audit: None,
        trigger: settings(2),
        segment: Duration::from_secs(60),
    });
    assert!(monitor.detection_enabled());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while exporter.calls.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "trigger never exported");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(monitor.metrics().triggers, 1);

    monitor.shutdown().await;
    assert_eq!(exporter.calls.load(Ordering::SeqCst), 1);
}
