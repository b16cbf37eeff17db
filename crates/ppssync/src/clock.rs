//! PPS-derived logical clock.
//!
//! The hardware callback hands raw edge timestamps to a [`PulseSender`], which
//! only ever performs a non-blocking enqueue. The sync worker drains the
//! matching [`PulseReceiver`] and feeds each timestamp into a [`PulseClock`],
//! which owns the pulse sequence, the last pulse time and the jitter-based
//! stability metric.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Pulse timestamps needed before stability is defined (two intervals).
pub const MIN_STABILITY_SAMPLES: usize = 3;

/// Every Nth pulse is logged at debug level.
const PULSE_LOG_EVERY: u64 = 10;

/// Jitter-based quality of the PPS signal.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    /// Not enough pulses have been seen yet.
    #[default]
    Undefined,
    /// A measured value in `[0, 1]`, where 1 means no jitter.
    Measured(f64),
}

impl Stability {
    /// The numeric value, with [`Stability::Undefined`] read as 0.
    #[must_use]
    pub fn value(self) -> f64 {
        match self {
            Self::Undefined => 0.0,
            Self::Measured(v) => v,
        }
    }

    /// The measured value, if any.
    #[must_use]
    pub fn measured(self) -> Option<f64> {
        match self {
            Self::Undefined => None,
            Self::Measured(v) => Some(v),
        }
    }

    /// Whether enough pulses have been seen to measure jitter.
    #[must_use]
    pub fn is_defined(self) -> bool {
        matches!(self, Self::Measured(_))
    }
}

impl fmt::Display for Stability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Measured(v) => write!(f, "{v:.4}"),
        }
    }
}

/// One accepted pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseEvent {
    /// Position in the session's pulse sequence, starting at 1.
    pub sequence: u64,
    /// Wall-clock time at which the edge was observed.
    pub observed_at: DateTime<Utc>,
}

/// Immutable copy of the clock state at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClockSnapshot {
    /// Pulses accepted so far; 0 before the first pulse.
    pub pulse_sequence: u64,
    /// Time of the most recent pulse.
    pub pulse_observed_at: Option<DateTime<Utc>>,
    /// Signal stability at that instant.
    pub stability: Stability,
}

impl ClockSnapshot {
    /// Whether at least one pulse had been seen.
    #[must_use]
    pub fn has_pulse(&self) -> bool {
        self.pulse_sequence > 0
    }
}

/// Logical clock driven by PPS edges.
///
/// Not synchronized on its own: the owner keeps it behind the same lock as the
/// event ledger so snapshots and events are never torn.
#[derive(Debug, Clone)]
pub struct PulseClock {
    sequence: u64,
    last_observed: Option<DateTime<Utc>>,
    history: VecDeque<DateTime<Utc>>,
    // Intervals measured; `history` holds one more timestamp than this.
    window: usize,
    stability: Stability,
    last_latency: Option<Duration>,
}

impl PulseClock {
    /// Create a clock that measures stability over the last `window`
    /// pulse intervals.
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(MIN_STABILITY_SAMPLES - 1);
        Self {
            sequence: 0,
            last_observed: None,
            history: VecDeque::with_capacity(window + 1),
            window,
            stability: Stability::Undefined,
            last_latency: None,
        }
    }

    /// Accept one pulse observed at `wall_time` and publish the new state.
    ///
    /// A timestamp earlier than the previous pulse (wall clock stepped back)
    /// is clamped so `observed_at` never decreases.
    pub fn record(&mut self, wall_time: DateTime<Utc>) -> PulseEvent {
        let observed_at = match self.last_observed {
            Some(last) if wall_time < last => {
                warn!(
                    "PPS timestamp {} precedes previous pulse {}, clamping",
                    wall_time, last
                );
                last
            }
            _ => wall_time,
        };

        if self.history.len() > self.window {
            self.history.pop_front();
        }
        self.history.push_back(observed_at);
        self.stability = compute_stability(&self.history);

        self.sequence += 1;
        self.last_observed = Some(observed_at);

        if self.sequence % PULSE_LOG_EVERY == 0 {
            debug!(
                "PPS signal #{} detected at {} (stability {})",
                self.sequence, observed_at, self.stability
            );
        } else {
            trace!("PPS signal #{} detected at {}", self.sequence, observed_at);
        }

        PulseEvent {
            sequence: self.sequence,
            observed_at,
        }
    }

    /// Note how long a pulse waited between the edge and the worker.
    pub fn note_latency(&mut self, latency: Duration) {
        self.last_latency = Some(latency);
    }

    /// Copy out the current state.
    #[must_use]
    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            pulse_sequence: self.sequence,
            pulse_observed_at: self.last_observed,
            stability: self.stability,
        }
    }

    /// Pulses accepted so far.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Time of the most recent pulse.
    #[must_use]
    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.last_observed
    }

    /// Current stability.
    #[must_use]
    pub fn stability(&self) -> Stability {
        self.stability
    }

    /// Most recent edge-to-drain delay.
    #[must_use]
    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }
}

/// `1 - min(1, max |interval_i - mean|)` over the intervals in `history`.
#[allow(clippy::cast_precision_loss)]
fn compute_stability(history: &VecDeque<DateTime<Utc>>) -> Stability {
    if history.len() < MIN_STABILITY_SAMPLES {
        return Stability::Undefined;
    }

    let intervals: Vec<f64> = history
        .iter()
        .zip(history.iter().skip(1))
        .map(|(a, b)| {
            let micros = (*b - *a).num_microseconds().unwrap_or(i64::MAX);
            micros as f64 / 1_000_000.0
        })
        .collect();

    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let max_deviation = intervals
        .iter()
        .map(|interval| (interval - mean).abs())
        .fold(0.0_f64, f64::max);

    Stability::Measured(1.0 - max_deviation.min(1.0))
}

/// Create the bounded queue between the edge callback and the sync worker.
#[must_use]
pub fn pulse_queue(capacity: usize) -> (PulseSender, PulseReceiver) {
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        PulseSender {
            tx,
            capacity,
            dropped: Arc::clone(&dropped),
        },
        PulseReceiver { rx, dropped },
    )
}

/// Callback-side end of the pulse queue.
#[derive(Debug, Clone)]
pub struct PulseSender {
    tx: Sender<DateTime<Utc>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl PulseSender {
    /// Enqueue a raw edge timestamp without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueOverflow`] when the queue is full. The pulse is
    /// dropped and counted; callers in callback context ignore the error.
    pub fn on_pulse(&self, wall_time: DateTime<Utc>) -> Result<()> {
        match self.tx.try_send(wall_time) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "Pulse queue full, dropped pulse at {} ({} dropped so far)",
                    wall_time, dropped
                );
                Err(Error::QueueOverflow {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("Pulse at {} arrived after the worker exited", wall_time);
                Ok(())
            }
        }
    }

    /// Pulses dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Worker-side end of the pulse queue.
#[derive(Debug)]
pub struct PulseReceiver {
    rx: Receiver<DateTime<Utc>>,
    dropped: Arc<AtomicU64>,
}

impl PulseReceiver {
    /// Wait up to `timeout` for the next pulse.
    ///
    /// Returns `None` on timeout or when every sender is gone.
    #[must_use]
    pub fn next_timeout(&self, timeout: Duration) -> Option<DateTime<Utc>> {
        match self.rx.recv_timeout(timeout) {
            Ok(wall_time) => Some(wall_time),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the next pulse if one is already queued.
    #[must_use]
    pub fn try_next(&self) -> Option<DateTime<Utc>> {
        self.rx.try_recv().ok()
    }

    /// Pulses currently waiting in the queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Pulses dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn channel(&self) -> &Receiver<DateTime<Utc>> {
        &self.rx
    }
}
