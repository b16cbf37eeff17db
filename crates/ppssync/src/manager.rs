//! The sync engine façade.
//!
//! [`SyncManager`] owns the pulse clock, the event ledger and the persistence
//! writer, and runs one worker thread that drains the pulse queue and flushes
//! the session document. Camera and GNSS threads share the manager through an
//! `Arc` and call the `register_*` methods; none of them ever returns an error.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::{
    pulse_queue, ClockSnapshot, PulseClock, PulseEvent, PulseReceiver, PulseSender, Stability,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hardware::{EdgeSource, Subscription};
use crate::ledger::{EventCounts, EventKind, EventLedger, LedgerView, Position};
use crate::storage::{FlushStats, PersistenceWriter};

/// Lifecycle state of a [`SyncManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Not running.
    #[default]
    Stopped,
    /// Claiming the edge source.
    Starting,
    /// Pulses are being accepted.
    Running,
    /// Shutting down the worker.
    Stopping,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Point-in-time report of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    /// Lifecycle state.
    pub state: SyncState,
    /// Whether pulses are being accepted.
    pub available: bool,
    /// Pulses accepted this session.
    pub pulse_count: u64,
    /// Time of the last accepted pulse.
    pub last_pulse_time: Option<DateTime<Utc>>,
    /// Stability, when defined.
    pub stability: Option<f64>,
    /// Pulses dropped because the queue was full.
    pub dropped_pulses: u64,
    /// Most recent delay between an edge and its dequeue, in milliseconds.
    pub drain_latency_ms: Option<f64>,
    /// Per-kind ledger counts.
    pub counts: EventCounts,
    /// Recordings still open.
    pub open_recordings: Vec<PathBuf>,
    /// Session document path, once a session has started.
    pub document_path: Option<PathBuf>,
    /// Flush bookkeeping.
    pub flush: FlushStats,
}

/// State guarded by the engine lock.
#[derive(Debug)]
struct Core {
    state: SyncState,
    clock: PulseClock,
    ledger: EventLedger,
}

impl Core {
    fn new(config: &Config) -> Self {
        Self {
            state: SyncState::Stopped,
            clock: PulseClock::new(config.sync.pulse_history_window),
            ledger: EventLedger::new(
                config.min_position_fix_interval(),
                config.sync.recent_pulse_retention,
            ),
        }
    }

    /// Snapshot reported by the getters; the "no pulse" sentinel unless
    /// running. Registrations stamp with `clock.snapshot()` in every state.
    fn reported_snapshot(&self) -> ClockSnapshot {
        if self.state == SyncState::Running {
            self.clock.snapshot()
        } else {
            ClockSnapshot::default()
        }
    }
}

/// Everything the worker thread shares with the façade.
#[derive(Debug)]
struct Shared {
    core: Mutex<Core>,
    // Lock order: writer, then core. The core lock is never held across I/O.
    // The writer lock is, so readers use the published copies below.
    writer: Mutex<Option<PersistenceWriter>>,
    flush_stats: Mutex<FlushStats>,
    document_path: Mutex<Option<PathBuf>>,
    sender: Mutex<Option<PulseSender>>,
}

impl Shared {
    fn accept_pulse(&self, wall_time: DateTime<Utc>) {
        let latency = (Utc::now() - wall_time).to_std().unwrap_or_default();
        let mut core = self.core.lock();
        let event = core.clock.record(wall_time);
        core.clock.note_latency(latency);
        core.ledger.push_pulse(event);
    }

    fn flush(&self, force: bool) {
        let mut writer = self.writer.lock();
        self.flush_locked(writer.as_mut(), force);
    }

    fn flush_locked(&self, writer: Option<&mut PersistenceWriter>, force: bool) {
        let Some(writer) = writer else {
            return;
        };
        let view = self.core.lock().ledger.view();
        // Failures are logged and counted by the writer; the next flush retries.
        let _ = writer.flush(&view, force);
        *self.flush_stats.lock() = writer.stats().clone();
    }
}

/// Handles owned by a running session.
#[derive(Debug)]
struct Session {
    subscription: Subscription,
    stop_flag: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    worker: JoinHandle<()>,
}

/// PPS-disciplined event timeline.
///
/// Create one per process with [`SyncManager::new`] and share it via `Arc`.
pub struct SyncManager {
    config: Config,
    source: Arc<dyn EdgeSource>,
    shared: Arc<Shared>,
    flush_tx: Sender<()>,
    flush_rx: Receiver<()>,
    // Serializes start() and stop(); holds the live session.
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManager")
            .field("source", &self.source.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    /// Create a stopped manager.
    #[must_use]
    pub fn new(config: Config, source: Arc<dyn EdgeSource>) -> Self {
        let (flush_tx, flush_rx) = bounded(1);
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core::new(&config)),
                writer: Mutex::new(None),
                flush_stats: Mutex::new(FlushStats::default()),
                document_path: Mutex::new(None),
                sender: Mutex::new(None),
            }),
            config,
            source,
            flush_tx,
            flush_rx,
            session: Mutex::new(None),
        }
    }

    /// The configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Claim the edge source and start the worker.
    ///
    /// A no-op when sync is disabled or the manager is already running. Each
    /// session after the first starts from an empty clock and ledger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] for an invalid configuration,
    /// [`Error::HardwareUnavailable`] if the edge source cannot be claimed, or
    /// an I/O error if the session directory cannot be created. The manager
    /// stays stopped.
    pub fn start(&self) -> Result<()> {
        if !self.config.sync.enabled {
            info!("PPS sync disabled in configuration, not starting");
            return Ok(());
        }
        self.config.validate()?;

        let mut session = self.session.lock();
        if session.is_some() {
            debug!("PPS sync already running");
            return Ok(());
        }

        self.set_state(SyncState::Starting);
        match self.launch() {
            Ok(started) => {
                *session = Some(started);
                self.set_state(SyncState::Running);
                info!(
                    "PPS sync started on pin {} using {} edge source",
                    self.config.sync.pulse_source_pin,
                    self.source.name()
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(SyncState::Stopped);
                error!("Failed to start PPS sync: {}", err);
                Err(err)
            }
        }
    }

    fn launch(&self) -> Result<Session> {
        let path = self.config.session_document_path(Utc::now());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        // A worker left detached by an earlier stop may still be writing.
        let mut writer = self
            .shared
            .writer
            .try_lock_for(self.config.stop_timeout())
            .ok_or_else(|| Error::internal("previous session is still flushing"))?;

        let (sender, receiver) = pulse_queue(self.config.sync.queue_capacity);
        let callback_sender = sender.clone();
        let subscription = self.source.subscribe_rising_edge(
            self.config.sync.pulse_source_pin,
            Box::new(move |wall_time| {
                // A full queue is counted by the sender; nothing reaches the edge thread.
                let _ = callback_sender.on_pulse(wall_time);
            }),
        )?;

        if writer.is_some() {
            *self.shared.core.lock() = Core::new(&self.config);
        }
        *writer = Some(PersistenceWriter::new(&path));
        drop(writer);
        *self.shared.flush_stats.lock() = FlushStats::default();
        *self.shared.document_path.lock() = Some(path.clone());
        *self.shared.sender.lock() = Some(sender);
        while self.flush_rx.try_recv().is_ok() {}

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            pulses: receiver,
            flush_rx: self.flush_rx.clone(),
            stop_rx,
            stop_flag: Arc::clone(&stop_flag),
            flush_interval: self.config.flush_interval(),
        };

        let spawned = thread::Builder::new()
            .name("ppssync-worker".to_string())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            });

        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(err) = self.source.unsubscribe(subscription) {
                    warn!("Failed to release edge source: {}", err);
                }
                return Err(Error::internal(format!("failed to spawn sync worker: {e}")));
            }
        };

        debug!("Sync session document: {}", path.display());
        Ok(Session {
            subscription,
            stop_flag,
            stop_tx,
            done_rx,
            worker,
        })
    }

    /// Stop the worker, release the edge source and flush once.
    ///
    /// Idempotent. If the worker does not exit within the stop timeout it is
    /// left running detached and the flush happens anyway, unless the worker
    /// is itself stuck writing, in which case the flush is skipped after a
    /// second stop timeout.
    pub fn stop(&self) {
        let mut session = self.session.lock();
        let Some(running) = session.take() else {
            debug!("PPS sync not running, nothing to stop");
            return;
        };

        self.set_state(SyncState::Stopping);

        if let Err(err) = self.source.unsubscribe(running.subscription) {
            warn!("Failed to release edge source: {}", err);
        }

        running.stop_flag.store(true, Ordering::Release);
        drop(running.stop_tx);

        match running.done_rx.recv_timeout(self.config.stop_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if running.worker.join().is_err() {
                    error!("Sync worker panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Sync worker did not stop within {:?}, leaving it detached",
                    self.config.stop_timeout()
                );
            }
        }

        match self.shared.writer.try_lock_for(self.config.stop_timeout()) {
            Some(mut writer) => self.shared.flush_locked(writer.as_mut(), true),
            None => warn!(
                "Session document is busy after {:?}, skipping final flush",
                self.config.stop_timeout()
            ),
        }
        self.set_state(SyncState::Stopped);
        info!("PPS sync stopped");
    }

    fn set_state(&self, state: SyncState) {
        self.shared.core.lock().state = state;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.shared.core.lock().state
    }

    /// Whether pulses are being accepted.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state() == SyncState::Running
    }

    /// Time of the last accepted pulse, or `None` before the first pulse or
    /// while unavailable.
    #[must_use]
    pub fn last_pulse_time(&self) -> Option<DateTime<Utc>> {
        self.snapshot().pulse_observed_at
    }

    /// Pulses accepted this session; 0 while unavailable.
    #[must_use]
    pub fn pulse_count(&self) -> u64 {
        self.snapshot().pulse_sequence
    }

    /// Current stability; undefined while unavailable.
    #[must_use]
    pub fn stability(&self) -> Stability {
        self.snapshot().stability
    }

    /// Clock state as reported by the getters: the "no pulse" sentinel unless
    /// running.
    #[must_use]
    pub fn snapshot(&self) -> ClockSnapshot {
        self.shared.core.lock().reported_snapshot()
    }

    /// Up to `limit` of the most recent pulses, newest last.
    #[must_use]
    pub fn recent_pulses(&self, limit: usize) -> Vec<PulseEvent> {
        self.shared.core.lock().ledger.recent_pulses(limit)
    }

    /// A consistent copy of the ledger.
    #[must_use]
    pub fn ledger_view(&self) -> LedgerView {
        self.shared.core.lock().ledger.view()
    }

    /// Full status report.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let flush = self.shared.flush_stats.lock().clone();
        let document_path = self.shared.document_path.lock().clone();
        let dropped_pulses = self
            .shared
            .sender
            .lock()
            .as_ref()
            .map_or(0, PulseSender::dropped);

        let core = self.shared.core.lock();
        let snapshot = core.reported_snapshot();
        let running = core.state == SyncState::Running;
        SyncStatus {
            state: core.state,
            available: running,
            pulse_count: snapshot.pulse_sequence,
            last_pulse_time: snapshot.pulse_observed_at,
            stability: snapshot.stability.measured(),
            dropped_pulses,
            drain_latency_ms: core
                .clock
                .last_latency()
                .filter(|_| running)
                .map(|latency| latency.as_secs_f64() * 1_000.0),
            counts: core.ledger.counts(),
            open_recordings: core.ledger.open_recordings(),
            document_path,
            flush,
        }
    }

    /// Register the start of a recording written to `path`.
    ///
    /// A second start for a path that is already recording is logged and
    /// ignored.
    pub fn register_recording_start(&self, path: impl AsRef<Path>, start_time: DateTime<Utc>) {
        let path = path.as_ref();
        let result = {
            let mut core = self.shared.core.lock();
            let snapshot = core.clock.snapshot();
            core.ledger.open_recording(path, start_time, snapshot)
        };

        match result {
            Ok(()) => {
                info!("Registered recording start: {}", path.display());
                self.request_flush(EventKind::Recording);
            }
            Err(err) => warn!("Ignoring recording start: {}", err),
        }
    }

    /// Register the end of the recording written to `path`.
    ///
    /// A stop for a path that is not recording is logged and ignored.
    pub fn register_recording_stop(&self, path: impl AsRef<Path>, stop_time: DateTime<Utc>) {
        let path = path.as_ref();
        let result = {
            let mut core = self.shared.core.lock();
            let snapshot = core.clock.snapshot();
            core.ledger.close_recording(path, stop_time, snapshot)
        };

        match result {
            Ok(()) => {
                info!("Registered recording stop: {}", path.display());
                self.request_flush(EventKind::Recording);
            }
            Err(err) => warn!("Ignoring recording stop: {}", err),
        }
    }

    /// Register a photo saved to `path`.
    pub fn register_photo_capture(&self, path: impl AsRef<Path>, capture_time: DateTime<Utc>) {
        let path = path.as_ref();
        {
            let mut core = self.shared.core.lock();
            let snapshot = core.clock.snapshot();
            core.ledger.add_photo(path, capture_time, snapshot);
        }
        info!("Registered photo capture: {}", path.display());
        self.request_flush(EventKind::Photo);
    }

    /// Register a GNSS fix. Fixes arriving within the minimum interval of the
    /// last stored fix (by this machine's clock) are dropped.
    pub fn register_position_update(&self, position: Position, fix_time: DateTime<Utc>) {
        let stored = {
            let mut core = self.shared.core.lock();
            let snapshot = core.clock.snapshot();
            core.ledger
                .add_position_fix(position, fix_time, snapshot, Utc::now())
        };

        if stored {
            debug!(
                "Registered position fix {:.6},{:.6}",
                position.latitude, position.longitude
            );
            self.request_flush(EventKind::PositionFix);
        }
    }

    fn request_flush(&self, kind: EventKind) {
        if !kind.triggers_flush() || !self.is_available() {
            return;
        }
        // A full channel already holds a pending request.
        let _ = self.flush_tx.try_send(());
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The sync worker thread.
struct Worker {
    shared: Arc<Shared>,
    pulses: PulseReceiver,
    flush_rx: Receiver<()>,
    stop_rx: Receiver<()>,
    stop_flag: Arc<AtomicBool>,
    flush_interval: Duration,
}

impl Worker {
    fn run(self) {
        debug!("Sync worker started");
        let mut next_flush = Instant::now() + self.flush_interval;

        while !self.stop_flag.load(Ordering::Acquire) {
            let wait = next_flush.saturating_duration_since(Instant::now());
            select! {
                recv(self.pulses.channel()) -> msg => match msg {
                    Ok(wall_time) => self.shared.accept_pulse(wall_time),
                    Err(_) => break,
                },
                recv(self.flush_rx) -> msg => {
                    if msg.is_ok() {
                        self.shared.flush(false);
                    }
                },
                recv(self.stop_rx) -> _ => break,
                default(wait) => {},
            }

            if !self.stop_flag.load(Ordering::Acquire) && Instant::now() >= next_flush {
                self.shared.flush(false);
                next_flush = Instant::now() + self.flush_interval;
            }
        }

        debug!(
            "Sync worker exiting ({} pulses left in queue)",
            self.pulses.pending()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{EdgeCallback, ManualEdgeSource, UnavailableEdgeSource};
    use crate::storage::SyncDocument;
    use chrono::TimeZone;

    const PIN: u32 = 18;

    fn test_config(dir: &Path) -> Config {
        crate::logging::init_test_logging();
        let mut config = Config::default();
        config.sync.pulse_source_pin = PIN;
        config.sync.stop_timeout_ms = 2_000;
        config.storage.base_path = Some(dir.to_path_buf());
        config.storage.use_timestamp_subdir = false;
        config
    }

    fn manual_manager(config: Config) -> (Arc<ManualEdgeSource>, SyncManager) {
        let source = Arc::new(ManualEdgeSource::new());
        let manager = SyncManager::new(config, Arc::clone(&source) as Arc<dyn EdgeSource>);
        (source, manager)
    }

    fn pulse_at(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(n)
    }

    /// Hands edges through to a manual source but takes a while to release
    /// them, holding `stop()` in the stopping state.
    struct SlowReleaseSource {
        inner: Arc<ManualEdgeSource>,
        release_delay: Duration,
    }

    impl EdgeSource for SlowReleaseSource {
        fn name(&self) -> &'static str {
            "slow-release"
        }

        fn subscribe_rising_edge(&self, pin: u32, callback: EdgeCallback) -> Result<Subscription> {
            self.inner.subscribe_rising_edge(pin, callback)
        }

        fn unsubscribe(&self, handle: Subscription) -> Result<()> {
            thread::sleep(self.release_delay);
            self.inner.unsubscribe(handle)
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn fire_pulses(source: &ManualEdgeSource, manager: &SyncManager, n: i64) {
        let before = manager.pulse_count();
        let first = i64::try_from(before).unwrap();
        for i in 0..n {
            source.fire(PIN, pulse_at(first + i));
        }
        let expected = before + u64::try_from(n).unwrap();
        assert!(wait_until(|| manager.pulse_count() == expected));
    }

    #[test]
    fn test_pulses_are_counted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();
        assert_eq!(manager.state(), SyncState::Running);

        fire_pulses(&source, &manager, 5);

        let sequences: Vec<u64> = manager.recent_pulses(10).iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(manager.last_pulse_time(), Some(pulse_at(4)));
        assert!(manager.stability().is_defined());
        manager.stop();
    }

    #[test]
    fn test_recording_span_is_persisted_with_ordered_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();

        fire_pulses(&source, &manager, 2);
        manager.register_recording_start("a.mp4", pulse_at(2));
        fire_pulses(&source, &manager, 3);
        manager.register_recording_stop("a.mp4", pulse_at(5));
        manager.stop();

        let path = manager.status().document_path.unwrap();
        let view = SyncDocument::load(&path).unwrap().to_view();
        assert_eq!(view.recordings.len(), 1);
        let span = &view.recordings[0];
        let stop = span.stop_snapshot.unwrap();
        assert_eq!(span.start_snapshot.pulse_sequence, 2);
        assert_eq!(stop.pulse_sequence, 5);
        assert!(stop.pulse_sequence >= span.start_snapshot.pulse_sequence);
    }

    #[test]
    fn test_recording_start_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (_source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();

        manager.register_recording_start("a.mp4", pulse_at(0));
        let path = manager.status().document_path.unwrap();
        assert!(wait_until(|| SyncDocument::load(&path)
            .map(|doc| doc.recordings.len() == 1)
            .unwrap_or(false)));
        manager.stop();
    }

    #[test]
    fn test_unknown_stop_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (_source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();

        manager.register_recording_stop("never.mp4", pulse_at(0));

        let status = manager.status();
        assert_eq!(status.counts.recordings, 0);
        assert!(status.open_recordings.is_empty());
        manager.stop();
    }

    #[test]
    fn test_duplicate_start_keeps_one_open_span() {
        let dir = tempfile::tempdir().unwrap();
        let (_source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();

        manager.register_recording_start("a.mp4", pulse_at(0));
        manager.register_recording_start("a.mp4", pulse_at(1));

        let status = manager.status();
        assert_eq!(status.counts.recordings, 1);
        assert_eq!(status.open_recordings, vec![PathBuf::from("a.mp4")]);
        assert_eq!(manager.ledger_view().recordings[0].start_time, pulse_at(0));
        manager.stop();
    }

    #[test]
    fn test_position_fixes_are_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let (_source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();

        let here = Position::new(35.0, 139.0, Some(40.0));
        manager.register_position_update(here, pulse_at(0));
        // Producer time is far apart, local time is not.
        manager.register_position_update(here, pulse_at(600));

        assert_eq!(manager.status().counts.position_fixes, 1);
        manager.stop();
    }

    #[test]
    fn test_photos_are_stamped_with_the_clock() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();

        fire_pulses(&source, &manager, 3);
        manager.register_photo_capture("p.jpg", pulse_at(3));

        let view = manager.ledger_view();
        assert_eq!(view.photos[0].snapshot.pulse_sequence, 3);
        assert_eq!(view.photos[0].snapshot.pulse_observed_at, Some(pulse_at(2)));
        manager.stop();
    }

    #[test]
    fn test_flush_then_reload_reproduces_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();

        fire_pulses(&source, &manager, 4);
        manager.register_recording_start("a.mp4", pulse_at(4));
        manager.register_recording_stop("a.mp4", pulse_at(5));
        manager.register_recording_start("b.mp4", pulse_at(6));
        manager.register_photo_capture("p.jpg", pulse_at(6));
        manager.register_position_update(Position::new(1.0, 2.0, None), pulse_at(6));
        let expected = manager.status().counts;
        manager.stop();

        let path = manager.status().document_path.unwrap();
        assert_eq!(SyncDocument::load(path).unwrap().counts(), expected);
    }

    #[test]
    fn test_disabled_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.sync.enabled = false;
        let (source, manager) = manual_manager(config);

        manager.start().unwrap();

        assert_eq!(manager.state(), SyncState::Stopped);
        assert!(!manager.is_available());
        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(manager.last_pulse_time(), None);
        assert_eq!(manager.pulse_count(), 0);
    }

    #[test]
    fn test_unavailable_hardware_leaves_manager_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SyncManager::new(
            test_config(dir.path()),
            Arc::new(UnavailableEdgeSource::new("no line")),
        );

        let err = manager.start().unwrap_err();

        assert!(err.is_hardware_unavailable());
        assert_eq!(manager.state(), SyncState::Stopped);
        assert_eq!(manager.stability(), Stability::Undefined);
        manager.stop();
    }

    #[test]
    fn test_start_twice_and_stop_twice() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));

        manager.start().unwrap();
        manager.start().unwrap();
        assert_eq!(source.subscriber_count(), 1);

        manager.stop();
        manager.stop();
        assert_eq!(manager.state(), SyncState::Stopped);
        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(manager.status().flush.writes, 1);
    }

    #[test]
    fn test_pulses_after_stop_are_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();
        fire_pulses(&source, &manager, 2);
        manager.stop();

        assert_eq!(source.fire(PIN, pulse_at(10)), 0);
        assert_eq!(manager.pulse_count(), 0);
        assert_eq!(manager.ledger_view().pulses.len(), 2);
    }

    #[test]
    fn test_restart_begins_a_fresh_session() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();
        fire_pulses(&source, &manager, 3);
        manager.register_photo_capture("p.jpg", pulse_at(3));
        manager.stop();

        manager.start().unwrap();
        assert_eq!(manager.pulse_count(), 0);
        assert_eq!(manager.status().counts.photos, 0);
        fire_pulses(&source, &manager, 1);
        assert_eq!(manager.pulse_count(), 1);
        manager.stop();
    }

    #[test]
    fn test_shared_across_producer_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));
        let manager = Arc::new(manager);
        manager.start().unwrap();

        let camera = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for i in 0..20 {
                    manager.register_photo_capture(format!("p{i}.jpg"), pulse_at(i));
                }
            })
        };
        for i in 0..20 {
            source.fire(PIN, pulse_at(i));
        }
        camera.join().unwrap();

        assert!(wait_until(|| manager.status().counts.photos == 20));
        assert!(wait_until(|| manager.pulse_count() + manager.status().dropped_pulses == 20));
        manager.stop();
    }

    #[test]
    fn test_status_reports_latency_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let (source, manager) = manual_manager(test_config(dir.path()));
        manager.start().unwrap();
        source.fire(PIN, Utc::now());
        assert!(wait_until(|| manager.pulse_count() == 1));

        let status = manager.status();
        assert!(status.available);
        assert!(status.drain_latency_ms.is_some());
        assert!(status.document_path.unwrap().starts_with(dir.path()));
        manager.stop();
    }

    #[test]
    fn test_stop_registered_while_stopping_keeps_clock_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(ManualEdgeSource::new());
        let source = SlowReleaseSource {
            inner: Arc::clone(&inner),
            release_delay: Duration::from_millis(300),
        };
        let manager = Arc::new(SyncManager::new(test_config(dir.path()), Arc::new(source)));
        manager.start().unwrap();

        fire_pulses(&inner, &manager, 3);
        manager.register_recording_start("a.mp4", pulse_at(3));

        let stopper = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.stop())
        };
        assert!(wait_until(|| manager.state() == SyncState::Stopping));
        manager.register_recording_stop("a.mp4", pulse_at(4));
        stopper.join().unwrap();

        let path = manager.status().document_path.unwrap();
        let view = SyncDocument::load(path).unwrap().to_view();
        let span = &view.recordings[0];
        assert_eq!(span.start_snapshot.pulse_sequence, 3);
        assert_eq!(span.stop_snapshot.unwrap().pulse_sequence, 3);
        assert_eq!(span.stop_snapshot.unwrap().pulse_observed_at, Some(pulse_at(2)));
        assert_eq!(manager.pulse_count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stop_is_bounded_when_document_write_hangs() {
        use std::io::Read;
        use std::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.sync.stop_timeout_ms = 300;
        let (_source, manager) = manual_manager(config);
        let manager = Arc::new(manager);
        manager.start().unwrap();

        // A FIFO in place of the temp file blocks the writer until it is read.
        let mut name = manager.status().document_path.unwrap().into_os_string();
        name.push(".tmp");
        let fifo = PathBuf::from(name);
        let made = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
        assert!(made.success());

        manager.register_photo_capture("p.jpg", pulse_at(0));
        thread::sleep(Duration::from_millis(200));

        let (done_tx, done_rx) = mpsc::channel();
        let stopper = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.stop();
                let _ = done_tx.send(());
            })
        };
        let stopped = done_rx.recv_timeout(Duration::from_secs(3)).is_ok();

        let mut contents = Vec::new();
        std::fs::File::open(&fifo)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        stopper.join().unwrap();

        assert!(stopped);
        assert_eq!(manager.state(), SyncState::Stopped);
        assert!(!contents.is_empty());
    }

    #[test]
    fn test_scheduled_flush_writes_position_fixes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.sync.flush_interval_seconds = 1;
        let (_source, manager) = manual_manager(config);
        manager.start().unwrap();

        manager.register_position_update(Position::new(35.0, 139.0, None), pulse_at(0));
        let path = manager.status().document_path.unwrap();
        assert!(wait_until(|| SyncDocument::load(&path)
            .map(|doc| doc.position_fixes.len() == 1)
            .unwrap_or(false)));
        assert_eq!(manager.state(), SyncState::Running);
        manager.stop();
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.sync.flush_interval_seconds = 0;
        let (source, manager) = manual_manager(config);

        let err = manager.start().unwrap_err();

        assert!(matches!(err, Error::ConfigValidation { .. }));
        assert_eq!(manager.state(), SyncState::Stopped);
        assert_eq!(source.subscriber_count(), 0);
    }
}
