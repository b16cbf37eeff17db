//! In-memory event ledger for a sync session.
//!
//! The ledger stores recording spans, photos and position fixes, each stamped
//! with the [`ClockSnapshot`] taken when it was registered, plus a bounded ring
//! of the most recent raw pulses. Nothing is ever removed except pulses that
//! fall out of the ring.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{ClockSnapshot, PulseEvent};

/// Registration calls that do not fit the ledger's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// A recording is already open for this artifact.
    #[error("recording already open for {}", path.display())]
    DuplicateArtifact {
        /// The artifact path.
        path: PathBuf,
    },

    /// No open recording exists for this artifact.
    #[error("no open recording for {}", path.display())]
    UnknownArtifact {
        /// The artifact path.
        path: PathBuf,
    },
}

/// The kinds of event the ledger stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A recording span was opened or closed.
    Recording,
    /// A photo was captured.
    Photo,
    /// A position fix was stored.
    PositionFix,
    /// A pulse was accepted.
    Pulse,
}

impl EventKind {
    /// Whether a mutation of this kind warrants an immediate flush.
    ///
    /// Recordings and photos are rare and valuable; fixes and pulses wait for
    /// the scheduled flush.
    #[must_use]
    pub fn triggers_flush(self) -> bool {
        matches!(self, Self::Recording | Self::Photo)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recording => write!(f, "recording"),
            Self::Photo => write!(f, "photo"),
            Self::PositionFix => write!(f, "position_fix"),
            Self::Pulse => write!(f, "pulse"),
        }
    }
}

/// A geographic position reported by the GNSS receiver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in decimal degrees.
    #[serde(rename = "lat")]
    pub latitude: f64,
    /// Longitude in decimal degrees.
    #[serde(rename = "lon")]
    pub longitude: f64,
    /// Altitude in metres, when the fix has one.
    #[serde(rename = "alt")]
    pub altitude: Option<f64>,
}

impl Position {
    /// Create a position.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, altitude: Option<f64>) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }
}

/// A video recording, open until its stop is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSpan {
    /// The recorded file.
    pub artifact_path: PathBuf,
    /// Producer-reported start time.
    pub start_time: DateTime<Utc>,
    /// Clock state at start.
    pub start_snapshot: ClockSnapshot,
    /// Position of the start among all recording registrations.
    pub start_order: u64,
    /// Producer-reported stop time.
    pub stop_time: Option<DateTime<Utc>>,
    /// Clock state at stop.
    pub stop_snapshot: Option<ClockSnapshot>,
    /// Position of the stop among all recording registrations.
    pub stop_order: Option<u64>,
}

impl RecordingSpan {
    /// Whether the stop has not been registered yet.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.stop_time.is_none()
    }
}

/// A captured photo.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoEvent {
    /// The photo file.
    pub artifact_path: PathBuf,
    /// Producer-reported capture time.
    pub capture_time: DateTime<Utc>,
    /// Clock state at capture.
    pub snapshot: ClockSnapshot,
}

/// A stored GNSS position fix.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFixEvent {
    /// The reported position.
    pub position: Position,
    /// Producer-reported fix time. Payload only; never used for rate limiting.
    pub fix_time: DateTime<Utc>,
    /// Clock state at registration.
    pub snapshot: ClockSnapshot,
}

/// Per-kind event counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    /// Recording spans, open or closed.
    pub recordings: usize,
    /// Spans still open.
    pub open_recordings: usize,
    /// Photos.
    pub photos: usize,
    /// Stored position fixes.
    pub position_fixes: usize,
    /// Pulses in the recent window.
    pub pulses: usize,
}

/// A consistent copy of the ledger, taken under the engine lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerView {
    /// Recording spans in registration order.
    pub recordings: Vec<RecordingSpan>,
    /// Photos in registration order.
    pub photos: Vec<PhotoEvent>,
    /// Stored position fixes in registration order.
    pub position_fixes: Vec<PositionFixEvent>,
    /// Recent pulses, newest last.
    pub pulses: Vec<PulseEvent>,
}

impl LedgerView {
    /// Per-kind counts of this view.
    #[must_use]
    pub fn counts(&self) -> EventCounts {
        EventCounts {
            recordings: self.recordings.len(),
            open_recordings: self.recordings.iter().filter(|s| s.is_open()).count(),
            photos: self.photos.len(),
            position_fixes: self.position_fixes.len(),
            pulses: self.pulses.len(),
        }
    }
}

/// Append-only store of correlated events for one session.
#[derive(Debug, Clone)]
pub struct EventLedger {
    recordings: Vec<RecordingSpan>,
    open: HashMap<PathBuf, usize>,
    recording_marks: u64,
    photos: Vec<PhotoEvent>,
    position_fixes: Vec<PositionFixEvent>,
    last_fix_accepted_at: Option<DateTime<Utc>>,
    min_fix_interval: Duration,
    pulses: VecDeque<PulseEvent>,
    pulse_retention: usize,
}

impl EventLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new(min_fix_interval: Duration, pulse_retention: usize) -> Self {
        Self {
            recordings: Vec::new(),
            open: HashMap::new(),
            recording_marks: 0,
            photos: Vec::new(),
            position_fixes: Vec::new(),
            last_fix_accepted_at: None,
            min_fix_interval,
            pulses: VecDeque::with_capacity(pulse_retention),
            pulse_retention,
        }
    }

    /// Open a recording span for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DuplicateArtifact`] if a span for `path` is
    /// already open. The existing span is left untouched.
    pub fn open_recording(
        &mut self,
        path: impl AsRef<Path>,
        start_time: DateTime<Utc>,
        snapshot: ClockSnapshot,
    ) -> Result<(), LedgerError> {
        let path = path.as_ref();
        if self.open.contains_key(path) {
            return Err(LedgerError::DuplicateArtifact {
                path: path.to_path_buf(),
            });
        }

        let order = self.next_recording_mark();
        self.open.insert(path.to_path_buf(), self.recordings.len());
        self.recordings.push(RecordingSpan {
            artifact_path: path.to_path_buf(),
            start_time,
            start_snapshot: snapshot,
            start_order: order,
            stop_time: None,
            stop_snapshot: None,
            stop_order: None,
        });
        Ok(())
    }

    /// Close the open span for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownArtifact`] if `path` was never opened or
    /// its span is already closed.
    pub fn close_recording(
        &mut self,
        path: impl AsRef<Path>,
        stop_time: DateTime<Utc>,
        snapshot: ClockSnapshot,
    ) -> Result<(), LedgerError> {
        let path = path.as_ref();
        let index = self
            .open
            .remove(path)
            .ok_or_else(|| LedgerError::UnknownArtifact {
                path: path.to_path_buf(),
            })?;

        let order = self.next_recording_mark();
        let span = &mut self.recordings[index];
        span.stop_time = Some(stop_time);
        span.stop_snapshot = Some(snapshot);
        span.stop_order = Some(order);
        Ok(())
    }

    fn next_recording_mark(&mut self) -> u64 {
        let order = self.recording_marks;
        self.recording_marks += 1;
        order
    }

    /// Record a photo capture.
    pub fn add_photo(
        &mut self,
        path: impl AsRef<Path>,
        capture_time: DateTime<Utc>,
        snapshot: ClockSnapshot,
    ) {
        self.photos.push(PhotoEvent {
            artifact_path: path.as_ref().to_path_buf(),
            capture_time,
            snapshot,
        });
    }

    /// Store a position fix unless one was stored less than the minimum
    /// interval before `now` (the engine's local wall clock).
    ///
    /// Returns whether the fix was stored.
    pub fn add_position_fix(
        &mut self,
        position: Position,
        fix_time: DateTime<Utc>,
        snapshot: ClockSnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(last) = self.last_fix_accepted_at {
            // A negative gap means the local clock stepped back; accept and rebase.
            if let Ok(gap) = (now - last).to_std() {
                if gap < self.min_fix_interval {
                    return false;
                }
            }
        }

        self.last_fix_accepted_at = Some(now);
        self.position_fixes.push(PositionFixEvent {
            position,
            fix_time,
            snapshot,
        });
        true
    }

    /// Append a pulse, evicting the oldest beyond the retention limit.
    pub fn push_pulse(&mut self, event: PulseEvent) {
        if self.pulse_retention == 0 {
            return;
        }
        if self.pulses.len() == self.pulse_retention {
            self.pulses.pop_front();
        }
        self.pulses.push_back(event);
    }

    /// Up to `limit` of the most recent pulses, newest last.
    #[must_use]
    pub fn recent_pulses(&self, limit: usize) -> Vec<PulseEvent> {
        let skip = self.pulses.len().saturating_sub(limit);
        self.pulses.iter().skip(skip).copied().collect()
    }

    /// Recording spans in registration order.
    #[must_use]
    pub fn recordings(&self) -> &[RecordingSpan] {
        &self.recordings
    }

    /// Photos in registration order.
    #[must_use]
    pub fn photos(&self) -> &[PhotoEvent] {
        &self.photos
    }

    /// Stored position fixes in registration order.
    #[must_use]
    pub fn position_fixes(&self) -> &[PositionFixEvent] {
        &self.position_fixes
    }

    /// Whether a span for `path` is currently open.
    #[must_use]
    pub fn is_recording(&self, path: impl AsRef<Path>) -> bool {
        self.open.contains_key(path.as_ref())
    }

    /// Paths with an open span, sorted.
    #[must_use]
    pub fn open_recordings(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.open.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Per-kind counts.
    #[must_use]
    pub fn counts(&self) -> EventCounts {
        EventCounts {
            recordings: self.recordings.len(),
            open_recordings: self.open.len(),
            photos: self.photos.len(),
            position_fixes: self.position_fixes.len(),
            pulses: self.pulses.len(),
        }
    }

    /// Copy the ledger for persistence.
    #[must_use]
    pub fn view(&self) -> LedgerView {
        LedgerView {
            recordings: self.recordings.clone(),
            photos: self.photos.clone(),
            position_fixes: self.position_fixes.clone(),
            pulses: self.pulses.iter().copied().collect(),
        }
    }
}
