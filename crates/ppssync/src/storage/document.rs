//! On-disk session document.
//!
//! The document is plain JSON with camelCase keys:
//!
//! ```text
//! {
//!   "recordings":    [ {event, path, time, pulseCount, pulseTime, pulseStability?} ],
//!   "photos":        [ {path, time, pulseCount, pulseTime, pulseStability?} ],
//!   "positionFixes": [ {position: {lat, lon, alt}, time, pulseCount, pulseTime, pulseStability?} ],
//!   "pulseEvents":   [ {count, time} ]
//! }
//! ```
//!
//! Recording entries appear in registration order, so the starts and stops of
//! overlapping recordings interleave the way they were registered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{ClockSnapshot, PulseEvent, Stability};
use crate::error::{Error, Result};
use crate::ledger::{
    EventCounts, LedgerView, PhotoEvent, Position, PositionFixEvent, RecordingSpan,
};

/// Which end of a recording span an entry marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMark {
    /// The recording started.
    Start,
    /// The recording stopped.
    Stop,
}

/// Clock state attached to a persisted event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulseStamp {
    /// Pulse sequence at registration.
    pub pulse_count: u64,
    /// Time of the last pulse at registration.
    pub pulse_time: Option<DateTime<Utc>>,
    /// Stability at registration, when defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse_stability: Option<f64>,
}

impl From<ClockSnapshot> for PulseStamp {
    fn from(snapshot: ClockSnapshot) -> Self {
        Self {
            pulse_count: snapshot.pulse_sequence,
            pulse_time: snapshot.pulse_observed_at,
            pulse_stability: snapshot.stability.measured(),
        }
    }
}

impl From<PulseStamp> for ClockSnapshot {
    fn from(stamp: PulseStamp) -> Self {
        Self {
            pulse_sequence: stamp.pulse_count,
            pulse_observed_at: stamp.pulse_time,
            stability: stamp
                .pulse_stability
                .map_or(Stability::Undefined, Stability::Measured),
        }
    }
}

/// One start or stop of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEntry {
    /// Start or stop.
    pub event: RecordingMark,
    /// The recorded file.
    pub path: PathBuf,
    /// Producer-reported time.
    pub time: DateTime<Utc>,
    /// Clock state at registration.
    #[serde(flatten)]
    pub stamp: PulseStamp,
}

/// A photo capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoEntry {
    /// The photo file.
    pub path: PathBuf,
    /// Producer-reported capture time.
    pub time: DateTime<Utc>,
    /// Clock state at registration.
    #[serde(flatten)]
    pub stamp: PulseStamp,
}

/// A stored position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFixEntry {
    /// The reported position.
    pub position: Position,
    /// Producer-reported fix time.
    pub time: DateTime<Utc>,
    /// Clock state at registration.
    #[serde(flatten)]
    pub stamp: PulseStamp,
}

/// One accepted pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseEntry {
    /// Pulse sequence number.
    pub count: u64,
    /// Observed wall-clock time.
    pub time: DateTime<Utc>,
}

/// The persisted form of a session's ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncDocument {
    /// Recording starts and stops.
    pub recordings: Vec<RecordingEntry>,
    /// Photo captures.
    pub photos: Vec<PhotoEntry>,
    /// Stored position fixes.
    pub position_fixes: Vec<PositionFixEntry>,
    /// The most recent pulses only.
    pub pulse_events: Vec<PulseEntry>,
}

impl From<&LedgerView> for SyncDocument {
    fn from(view: &LedgerView) -> Self {
        let mut marks: Vec<(u64, RecordingEntry)> = Vec::with_capacity(view.recordings.len() * 2);
        for span in &view.recordings {
            marks.push((
                span.start_order,
                RecordingEntry {
                    event: RecordingMark::Start,
                    path: span.artifact_path.clone(),
                    time: span.start_time,
                    stamp: span.start_snapshot.into(),
                },
            ));
            if let (Some(time), Some(snapshot)) = (span.stop_time, span.stop_snapshot) {
                marks.push((
                    span.stop_order.unwrap_or(span.start_order),
                    RecordingEntry {
                        event: RecordingMark::Stop,
                        path: span.artifact_path.clone(),
                        time,
                        stamp: snapshot.into(),
                    },
                ));
            }
        }
        marks.sort_by_key(|(order, _)| *order);
        let recordings = marks.into_iter().map(|(_, entry)| entry).collect();

        Self {
            recordings,
            photos: view
                .photos
                .iter()
                .map(|photo| PhotoEntry {
                    path: photo.artifact_path.clone(),
                    time: photo.capture_time,
                    stamp: photo.snapshot.into(),
                })
                .collect(),
            position_fixes: view
                .position_fixes
                .iter()
                .map(|fix| PositionFixEntry {
                    position: fix.position,
                    time: fix.fix_time,
                    stamp: fix.snapshot.into(),
                })
                .collect(),
            pulse_events: view
                .pulses
                .iter()
                .map(|pulse| PulseEntry {
                    count: pulse.sequence,
                    time: pulse.observed_at,
                })
                .collect(),
        }
    }
}

impl SyncDocument {
    /// Read a session document from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| Error::DocumentLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Rebuild the ledger view this document was written from.
    ///
    /// Stop entries are matched to the open start for the same path;
    /// a stop with no matching start is skipped.
    #[must_use]
    pub fn to_view(&self) -> LedgerView {
        let mut recordings: Vec<RecordingSpan> = Vec::new();
        let mut open: HashMap<&Path, usize> = HashMap::new();

        for (order, entry) in (0u64..).zip(&self.recordings) {
            match entry.event {
                RecordingMark::Start => {
                    open.insert(entry.path.as_path(), recordings.len());
                    recordings.push(RecordingSpan {
                        artifact_path: entry.path.clone(),
                        start_time: entry.time,
                        start_snapshot: entry.stamp.into(),
                        start_order: order,
                        stop_time: None,
                        stop_snapshot: None,
                        stop_order: None,
                    });
                }
                RecordingMark::Stop => match open.remove(entry.path.as_path()) {
                    Some(index) => {
                        let span = &mut recordings[index];
                        span.stop_time = Some(entry.time);
                        span.stop_snapshot = Some(entry.stamp.into());
                        span.stop_order = Some(order);
                    }
                    None => warn!(
                        "Stop entry for {} has no matching start",
                        entry.path.display()
                    ),
                },
            }
        }

        LedgerView {
            recordings,
            photos: self
                .photos
                .iter()
                .map(|entry| PhotoEvent {
                    artifact_path: entry.path.clone(),
                    capture_time: entry.time,
                    snapshot: entry.stamp.into(),
                })
                .collect(),
            position_fixes: self
                .position_fixes
                .iter()
                .map(|entry| PositionFixEvent {
                    position: entry.position,
                    fix_time: entry.time,
                    snapshot: entry.stamp.into(),
                })
                .collect(),
            pulses: self
                .pulse_events
                .iter()
                .map(|entry| PulseEvent {
                    sequence: entry.count,
                    observed_at: entry.time,
                })
                .collect(),
        }
    }

    /// Per-kind counts, with recordings counted as spans.
    #[must_use]
    pub fn counts(&self) -> EventCounts {
        self.to_view().counts()
    }
}
