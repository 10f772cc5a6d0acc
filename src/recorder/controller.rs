//! Ring-buffer recording state machine.
//!
//! `Idle -> Recording(i) -> Stopping(i) -> Idle`, with the ring index moving
//! to `(i + 1) % N` only on a successful finalize. All state lives behind one
//! async mutex shared by the segment timer and the trigger coordinator, and
//! the controller itself rejects overlapping writers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::RingConfig;
use crate::recorder::slots::{RingSlot, SlotTable};
use crate::recorder::{
    FinalizeNotifier, FinalizeResult, RecorderError, RecorderState, RingIndexStore,
    SegmentHandle, SegmentRecorder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(usize),
    /// Another segment is in flight; nothing was done.
    Busy(RecorderState),
    /// Recording is paused by a trigger export; the request is remembered.
    Paused,
    /// The controller was shut down and accepts no further segments.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was recording.
    Idle,
    Finalized(usize),
    Failed(usize),
    /// Finalize did not arrive in time; the segment was abandoned.
    TimedOut(usize),
}

/// Point-in-time view of the ring for observers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RingSnapshot {
    pub state: RecorderState,
    pub ring_index: usize,
    pub paused: bool,
    pub slots: Vec<RingSlot>,
}

struct ActiveSegment {
    slot: usize,
    generation: u64,
    handle: Box<dyn SegmentHandle>,
}

#[derive(Debug, Clone, Copy)]
struct FinalizeRecord {
    generation: u64,
    slot: usize,
    ok: bool,
}

struct Inner {
    state: RecorderState,
    ring_index: usize,
    slots: SlotTable,
    active: Option<ActiveSegment>,
    generation: u64,
    last_finalize: Option<FinalizeRecord>,
    paused: bool,
    deferred_start: bool,
    closed: bool,
}

struct Shared {
    name: String,
    inner: Mutex<Inner>,
    recorder: Arc<dyn SegmentRecorder>,
    store: Arc<dyn RingIndexStore>,
    state_tx: watch::Sender<RecorderState>,
}

#[derive(Clone)]
pub struct RingController {
    shared: Arc<Shared>,
}

impl RingController {
    /// Scan the segment directory, restore the persisted ring index and
    /// return an idle controller.
    pub fn open(
        config: &RingConfig,
        recorder: Arc<dyn SegmentRecorder>,
        store: Arc<dyn RingIndexStore>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.segment_dir).with_context(|| {
            format!("failed to create segment dir {}", config.segment_dir.display())
        })?;
        let slots = SlotTable::scan(&config.segment_dir, &config.extension, config.slots)
            .context("failed to scan ring slots")?;

        let n = slots.len();
        let ring_index = match store.load(&config.name)? {
            Some(i) if i < n => i,
            Some(i) => {
                warn!(stored = i, slots = n, "persisted ring index out of range, wrapping");
                i % n
            }
            // No record yet: continue after the newest file on disk.
            None => slots.most_recent().map(|i| (i + 1) % n).unwrap_or(0),
        };

        let existing = slots.all().iter().filter(|s| s.finalized).count();
        info!(
            ring = %config.name,
            slots = n,
            ring_index,
            existing,
            dir = %config.segment_dir.display(),
            "ring controller ready"
        );

        Ok(Self::with_slots(config.name.clone(), slots, ring_index, recorder, store))
    }

    pub fn with_slots(
        name: String,
        slots: SlotTable,
        ring_index: usize,
        recorder: Arc<dyn SegmentRecorder>,
        store: Arc<dyn RingIndexStore>,
    ) -> Self {
        let (state_tx, _) = watch::channel(RecorderState::Idle);
        Self {
            shared: Arc::new(Shared {
                name,
                inner: Mutex::new(Inner {
                    state: RecorderState::Idle,
                    ring_index,
                    slots,
                    active: None,
                    generation: 0,
                    last_finalize: None,
                    paused: false,
                    deferred_start: false,
                    closed: false,
                }),
                recorder,
                store,
                state_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RecorderState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> RecorderState {
        *self.shared.state_tx.borrow()
    }

    pub async fn ring_index(&self) -> usize {
        self.shared.inner.lock().await.ring_index
    }

    pub async fn snapshot(&self) -> RingSnapshot {
        let inner = self.shared.inner.lock().await;
        RingSnapshot {
            state: inner.state,
            ring_index: inner.ring_index,
            paused: inner.paused,
            slots: inner.slots.all().to_vec(),
        }
    }

    /// The `k` most recently finalized slots, oldest first.
    pub async fn latest_finalized(&self, k: usize) -> Vec<RingSlot> {
        let inner = self.shared.inner.lock().await;
        inner.slots.latest_finalized(inner.ring_index, k)
    }

    /// Begin a segment in the current ring slot.
    ///
    /// A no-op unless the controller is idle, not paused and not shut down.
    pub async fn start(&self) -> Result<StartOutcome, RecorderError> {
        let mut inner = self.shared.inner.lock().await;

        if inner.closed {
            debug!("start ignored, ring controller is shut down");
            return Ok(StartOutcome::Closed);
        }
        if inner.paused {
            inner.deferred_start = true;
            debug!("start deferred, recording paused");
            return Ok(StartOutcome::Paused);
        }
        if !inner.state.is_idle() {
            debug!(state = ?inner.state, "start ignored, segment already in flight");
            return Ok(StartOutcome::Busy(inner.state));
        }

        let slot = inner.ring_index;
        let path = inner.slots.path(slot).to_path_buf();

        // Exclusive write access: clear whatever the slot held before.
        inner.slots.invalidate(slot);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(slot, path = %path.display(), "removed previous segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut handle = self.shared.recorder.prepare_segment(slot, &path).await?;
        let (notifier, finalized) = FinalizeNotifier::channel();
        handle.start(notifier).await?;

        inner.generation += 1;
        let generation = inner.generation;
        inner.active = Some(ActiveSegment { slot, generation, handle });
        self.set_state(&mut inner, RecorderState::Recording(slot));
        drop(inner);

        let controller = self.clone();
        tokio::spawn(async move {
            let result = finalized
                .await
                .unwrap_or_else(|_| Err("recorder dropped the finalize signal".to_string()));
            controller.on_finalize(generation, slot, result).await;
        });

        info!(slot, path = %path.display(), "segment recording started");
        Ok(StartOutcome::Started(slot))
    }

    /// Request finalize of the in-flight segment. Returns `false` when
    /// nothing was recording.
    pub async fn stop(&self) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let RecorderState::Recording(slot) = inner.state else {
            debug!(state = ?inner.state, "stop ignored");
            return false;
        };

        self.set_state(&mut inner, RecorderState::Stopping(slot));
        if let Some(active) = inner.active.as_mut() {
            active.handle.stop().await;
        }
        debug!(slot, "segment stop requested");
        true
    }

    /// Stop the in-flight segment and wait up to `timeout` for its finalize.
    ///
    /// On timeout the segment is abandoned: the controller returns to idle
    /// without advancing, so the slot is rewritten next cycle.
    pub async fn stop_and_wait(&self, timeout: Duration) -> StopOutcome {
        let (slot, generation) = {
            let inner = self.shared.inner.lock().await;
            match (&inner.active, inner.state) {
                (Some(active), RecorderState::Recording(_) | RecorderState::Stopping(_)) => {
                    (active.slot, active.generation)
                }
                _ => return StopOutcome::Idle,
            }
        };

        self.stop().await;
        let settled = self.wait_idle(timeout).await;

        {
            let inner = self.shared.inner.lock().await;
            match inner.last_finalize {
                Some(rec) if rec.generation == generation && rec.ok => {
                    return StopOutcome::Finalized(rec.slot)
                }
                Some(rec) if rec.generation == generation => return StopOutcome::Failed(rec.slot),
                _ => {}
            }
        }

        if settled {
            // Abandoned by another caller before its finalize arrived.
            return StopOutcome::TimedOut(slot);
        }
        warn!(
            slot,
            timeout_ms = timeout.as_millis() as u64,
            "finalize timed out, abandoning segment"
        );
        self.abandon(generation).await;
        StopOutcome::TimedOut(slot)
    }

    /// Wait until the controller is idle. `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        // The guard borrows `rx`; bind it so it drops before `rx` does.
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_idle())).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// Block new segments until [`resume`](Self::resume). Returns whether a
    /// segment was in flight.
    pub async fn pause(&self) -> bool {
        let mut inner = self.shared.inner.lock().await;
        inner.paused = true;
        inner.deferred_start = false;
        !inner.state.is_idle()
    }

    /// Lift a pause, restarting recording when `restart` is set or a start
    /// was refused while paused.
    pub async fn resume(&self, restart: bool) -> Result<Option<StartOutcome>, RecorderError> {
        let deferred = {
            let mut inner = self.shared.inner.lock().await;
            inner.paused = false;
            std::mem::take(&mut inner.deferred_start)
        };
        if restart || deferred {
            return self.start().await.map(Some);
        }
        Ok(None)
    }

    /// Close the ring for good, then stop the in-flight segment with a
    /// bounded wait. Later `start` and `resume` calls return
    /// [`StartOutcome::Closed`].
    pub async fn shutdown(&self, timeout: Duration) -> StopOutcome {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.closed = true;
            inner.paused = true;
            inner.deferred_start = false;
        }
        let outcome = self.stop_and_wait(timeout).await;
        info!(?outcome, "ring controller shut down");
        outcome
    }

    async fn on_finalize(&self, generation: u64, slot: usize, result: FinalizeResult) {
        let mut inner = self.shared.inner.lock().await;

        match &inner.active {
            Some(active) if active.generation == generation => {}
            _ => {
                debug!(slot, generation, "late finalize for abandoned segment ignored");
                return;
            }
        }
        inner.active = None;

        let ok = result.is_ok();
        match result {
            Ok(()) => {
                inner.slots.mark_finalized(slot, Utc::now());
                let n = inner.slots.len();
                inner.ring_index = (slot + 1) % n;
                // Persist only after a confirmed finalize. Saving under the
                // lock keeps writes in ring order.
                self.persist_index(inner.ring_index).await;
                info!(slot, next = inner.ring_index, "segment finalized");
            }
            Err(reason) => {
                error!(slot, %reason, "segment finalize failed, slot will be retried");
            }
        }

        inner.last_finalize = Some(FinalizeRecord { generation, slot, ok });
        self.set_state(&mut inner, RecorderState::Idle);
    }

    async fn persist_index(&self, ring_index: usize) {
        let store = self.shared.store.clone();
        let name = self.shared.name.clone();
        match tokio::task::spawn_blocking(move || store.save(&name, ring_index)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, ring_index, "failed to persist ring index"),
            Err(e) => error!(error = %e, ring_index, "ring index save task failed"),
        }
    }

    async fn abandon(&self, generation: u64) {
        let mut inner = self.shared.inner.lock().await;
        match &inner.active {
            Some(active) if active.generation == generation => {}
            _ => return,
        }
        let Some(mut active) = inner.active.take() else {
            return;
        };
        // Still Stopping: no new writer may start until the old one is gone.
        active.handle.abort().await;
        inner.slots.invalidate(active.slot);
        debug!(slot = active.slot, "abandoned segment writer stopped");
        self.set_state(&mut inner, RecorderState::Idle);
    }

    fn set_state(&self, inner: &mut Inner, state: RecorderState) {
        inner.state = state;
        self.shared.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::MemoryIndexStore;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Recorder whose handles finalize on stop with a scripted outcome.
    #[derive(Default)]
    struct ScriptedRecorder {
        prepared: AtomicUsize,
        fail_next: StdMutex<Vec<bool>>,
        hang: bool,
        aborted: Arc<AtomicUsize>,
    }

    struct ScriptedHandle {
        notifier: Option<FinalizeNotifier>,
        fail: bool,
        hang: bool,
        path: std::path::PathBuf,
        aborted: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SegmentRecorder for ScriptedRecorder {
        async fn prepare_segment(
            &self,
            _slot: usize,
            path: &Path,
        ) -> Result<Box<dyn SegmentHandle>, RecorderError> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_next.lock().unwrap().pop().unwrap_or(false);
            Ok(Box::new(ScriptedHandle {
                notifier: None,
                fail,
                hang: self.hang,
                path: path.to_path_buf(),
                aborted: self.aborted.clone(),
            }))
        }
    }

    #[async_trait::async_trait]
    impl SegmentHandle for ScriptedHandle {
        async fn start(&mut self, notifier: FinalizeNotifier) -> Result<(), RecorderError> {
            self.notifier = Some(notifier);
            Ok(())
        }

        async fn stop(&mut self) {
            if self.hang {
                // Keep the notifier alive so finalize never resolves.
                return;
            }
            if let Some(n) = self.notifier.take() {
                if self.fail {
                    n.failure("encoder error");
                } else {
                    let _ = std::fs::write(&self.path, b"segment");
                    n.success();
                }
            }
        }

        async fn abort(&mut self) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            self.notifier.take();
        }
    }

    fn controller(dir: &Path, n: usize, recorder: Arc<ScriptedRecorder>) -> RingController {
        let slots = SlotTable::new(dir, "mp4", n);
        RingController::with_slots(
            "test".into(),
            slots,
            0,
            recorder,
            Arc::new(MemoryIndexStore::new()),
        )
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_full_cycle_returns_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), 6, Arc::new(ScriptedRecorder::default()));

        for expected in 0..6 {
            assert_eq!(ctl.start().await.unwrap(), StartOutcome::Started(expected));
            assert_eq!(ctl.stop_and_wait(WAIT).await, StopOutcome::Finalized(expected));
        }
        assert_eq!(ctl.ring_index().await, 0);
        assert!(ctl.state().is_idle());
    }

    #[tokio::test]
    async fn test_failed_finalize_retries_same_slot() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(ScriptedRecorder::default());
        let ctl = controller(dir.path(), 6, recorder.clone());

        ctl.start().await.unwrap();
        ctl.stop_and_wait(WAIT).await;
        assert_eq!(ctl.ring_index().await, 1);

        recorder.fail_next.lock().unwrap().push(true);
        assert_eq!(ctl.start().await.unwrap(), StartOutcome::Started(1));
        assert_eq!(ctl.stop_and_wait(WAIT).await, StopOutcome::Failed(1));
        assert_eq!(ctl.ring_index().await, 1);

        assert_eq!(ctl.start().await.unwrap(), StartOutcome::Started(1));
    }

    #[tokio::test]
    async fn test_double_start_is_single_writer() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(ScriptedRecorder::default());
        let ctl = controller(dir.path(), 6, recorder.clone());

        let (a, b) = tokio::join!(ctl.start(), ctl.start());
        let outcomes = [a.unwrap(), b.unwrap()];
        let started = outcomes
            .iter()
            .filter(|o| matches!(o, StartOutcome::Started(_)))
            .count();
        assert_eq!(started, 1);
        assert_eq!(recorder.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.state(), RecorderState::Recording(0));
    }

    #[tokio::test]
    async fn test_finalize_persists_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let ctl = RingController::with_slots(
            "cam".into(),
            SlotTable::new(dir.path(), "mp4", 3),
            2,
            Arc::new(ScriptedRecorder::default()),
            store.clone(),
        );
        // Nothing persisted while recording.
        ctl.start().await.unwrap();
        assert_eq!(store.load("cam").unwrap(), None);

        ctl.stop_and_wait(WAIT).await;
        assert_eq!(store.load("cam").unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_timeout_abandons_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(ScriptedRecorder { hang: true, ..Default::default() });
        let ctl = controller(dir.path(), 6, recorder.clone());

        ctl.start().await.unwrap();
        let outcome = ctl.stop_and_wait(Duration::from_millis(50)).await;
        assert_eq!(outcome, StopOutcome::TimedOut(0));
        assert!(ctl.state().is_idle());
        assert_eq!(ctl.ring_index().await, 0);
        assert!(ctl.latest_finalized(6).await.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_writer_is_aborted_before_next_start() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(ScriptedRecorder { hang: true, ..Default::default() });
        let ctl = controller(dir.path(), 6, recorder.clone());

        ctl.start().await.unwrap();
        assert_eq!(
            ctl.stop_and_wait(Duration::from_millis(50)).await,
            StopOutcome::TimedOut(0)
        );
        assert_eq!(recorder.aborted.load(Ordering::SeqCst), 1);

        assert_eq!(ctl.start().await.unwrap(), StartOutcome::Started(0));
        assert_eq!(recorder.prepared.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_later_starts() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), 6, Arc::new(ScriptedRecorder::default()));

        ctl.start().await.unwrap();
        assert!(ctl.pause().await);
        assert_eq!(ctl.shutdown(WAIT).await, StopOutcome::Finalized(0));

        // A trigger finishing after shutdown must not reopen the ring.
        assert_eq!(ctl.resume(true).await.unwrap(), Some(StartOutcome::Closed));
        assert_eq!(ctl.start().await.unwrap(), StartOutcome::Closed);
        assert!(ctl.state().is_idle());
        assert_eq!(ctl.ring_index().await, 1);
    }

    #[tokio::test]
    async fn test_pause_defers_start_until_resume() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), 6, Arc::new(ScriptedRecorder::default()));

        assert!(!ctl.pause().await);
        assert_eq!(ctl.start().await.unwrap(), StartOutcome::Paused);
        assert!(ctl.state().is_idle());

        let resumed = ctl.resume(false).await.unwrap();
        assert_eq!(resumed, Some(StartOutcome::Started(0)));
    }

    #[tokio::test]
    async fn test_start_replaces_existing_slot_file() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("0.mp4");
        std::fs::write(&stale, b"old segment").unwrap();

        let ctl = controller(dir.path(), 2, Arc::new(ScriptedRecorder::default()));
        ctl.start().await.unwrap();
        assert!(!stale.exists());

        ctl.stop_and_wait(WAIT).await;
        assert_eq!(std::fs::read(&stale).unwrap(), b"segment");
    }
}
