//! Pulse edge sources.
//!
//! An [`EdgeSource`] delivers rising-edge timestamps of the PPS line to a
//! callback. Callbacks run on the source's own thread and must not block; the
//! engine's callback only enqueues the timestamp.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, EdgeSourceKind};
use crate::error::{Error, Result};

/// Callback invoked with the wall-clock time of each rising edge.
pub type EdgeCallback = Box<dyn Fn(DateTime<Utc>) + Send + Sync>;

/// Handle returned by [`EdgeSource::subscribe_rising_edge`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    pin: u32,
}

impl Subscription {
    fn new(id: u64, pin: u32) -> Self {
        Self { id, pin }
    }

    /// Source-local identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pin the subscription listens on.
    #[must_use]
    pub fn pin(&self) -> u32 {
        self.pin
    }
}

/// A source of PPS rising edges.
pub trait EdgeSource: Send + Sync {
    /// The name of this edge source (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Start delivering rising edges on `pin` to `callback`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] if the line cannot be claimed.
    fn subscribe_rising_edge(&self, pin: u32, callback: EdgeCallback) -> Result<Subscription>;

    /// Stop delivering edges for `handle`. No callback runs after this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be released cleanly.
    fn unsubscribe(&self, handle: Subscription) -> Result<()>;
}

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

fn next_subscription(pin: u32) -> Subscription {
    Subscription::new(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed), pin)
}

/// Build the edge source named by the `[hardware]` section.
#[must_use]
pub fn edge_source_from_config(config: &Config) -> Arc<dyn EdgeSource> {
    match config.hardware.source {
        EdgeSourceKind::Gpio => gpio_source(config),
        EdgeSourceKind::Simulated => Arc::new(SimulatedEdgeSource::new(Duration::from_secs(1))),
        EdgeSourceKind::None => Arc::new(UnavailableEdgeSource::new("no edge source configured")),
    }
}

/// Name of the GPIO backend compiled into this build.
#[must_use]
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        ppssync_linux::platform_name()
    }
    #[cfg(not(target_os = "linux"))]
    {
        "unsupported (no GPIO backend)"
    }
}

#[cfg(target_os = "linux")]
fn gpio_source(config: &Config) -> Arc<dyn EdgeSource> {
    Arc::new(GpioEdgeSource::new(ppssync_linux::WatchConfig {
        sysfs_root: config.hardware.sysfs_root.clone(),
        debounce: config.debounce(),
        poll_interval: config.poll_interval(),
    }))
}

#[cfg(not(target_os = "linux"))]
fn gpio_source(_config: &Config) -> Arc<dyn EdgeSource> {
    Arc::new(UnavailableEdgeSource::new(
        "GPIO edge detection is only supported on Linux",
    ))
}

// ---------------------------------------------------------------------------

type SharedCallback = Arc<dyn Fn(DateTime<Utc>) + Send + Sync>;

/// Edge source fired by hand.
///
/// Edges are delivered synchronously on the thread calling [`fire`](Self::fire).
#[derive(Default)]
pub struct ManualEdgeSource {
    subscribers: Mutex<HashMap<u64, (u32, SharedCallback)>>,
}

impl fmt::Debug for ManualEdgeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualEdgeSource")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ManualEdgeSource {
    /// Create a source with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a rising edge at `wall_time` to every subscriber on `pin`.
    ///
    /// Returns the number of callbacks invoked.
    pub fn fire(&self, pin: u32, wall_time: DateTime<Utc>) -> usize {
        let callbacks: Vec<SharedCallback> = self
            .subscribers
            .lock()
            .values()
            .filter(|(subscribed, _)| *subscribed == pin)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &callbacks {
            callback(wall_time);
        }
        callbacks.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl EdgeSource for ManualEdgeSource {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn subscribe_rising_edge(&self, pin: u32, callback: EdgeCallback) -> Result<Subscription> {
        let subscription = next_subscription(pin);
        self.subscribers
            .lock()
            .insert(subscription.id, (pin, Arc::from(callback)));
        debug!("Manual edge source subscribed on pin {}", pin);
        Ok(subscription)
    }

    fn unsubscribe(&self, handle: Subscription) -> Result<()> {
        if self.subscribers.lock().remove(&handle.id).is_none() {
            debug!("Manual edge source: subscription {} already gone", handle.id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Edge source that can never be claimed.
#[derive(Debug, Clone)]
pub struct UnavailableEdgeSource {
    reason: String,
}

impl UnavailableEdgeSource {
    /// Create a source that fails every subscription with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl EdgeSource for UnavailableEdgeSource {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn subscribe_rising_edge(&self, pin: u32, _callback: EdgeCallback) -> Result<Subscription> {
        Err(Error::hardware_unavailable(self.name(), pin, &self.reason))
    }

    fn unsubscribe(&self, _handle: Subscription) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Generator {
    // Dropping the sender wakes the generator thread and ends it.
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Software pulse generator firing once per `period`.
#[derive(Debug)]
pub struct SimulatedEdgeSource {
    period: Duration,
    generators: Mutex<HashMap<u64, Generator>>,
}

impl SimulatedEdgeSource {
    /// Create a generator with the given pulse period.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            generators: Mutex::new(HashMap::new()),
        }
    }
}

impl EdgeSource for SimulatedEdgeSource {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn subscribe_rising_edge(&self, pin: u32, callback: EdgeCallback) -> Result<Subscription> {
        let subscription = next_subscription(pin);
        let (stop, stop_rx) = bounded::<()>(1);
        let period = self.period;

        let handle = thread::Builder::new()
            .name(format!("ppssync-sim-{pin}"))
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => callback(Utc::now()),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| Error::hardware_unavailable(self.name(), pin, e.to_string()))?;

        info!(
            "Simulated PPS generator started on pin {} (period {:?})",
            pin, period
        );
        self.generators
            .lock()
            .insert(subscription.id, Generator { stop, handle });
        Ok(subscription)
    }

    fn unsubscribe(&self, handle: Subscription) -> Result<()> {
        let Some(generator) = self.generators.lock().remove(&handle.id) else {
            debug!("Simulated generator {} already stopped", handle.id);
            return Ok(());
        };

        drop(generator.stop);
        generator
            .handle
            .join()
            .map_err(|_| Error::internal("simulated pulse generator panicked"))?;
        info!("Simulated PPS generator on pin {} stopped", handle.pin);
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Sysfs GPIO edge source.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct GpioEdgeSource {
    watch: ppssync_linux::WatchConfig,
    watchers: Mutex<HashMap<u64, ppssync_linux::GpioEdgeWatcher>>,
}

#[cfg(target_os = "linux")]
impl GpioEdgeSource {
    /// Create a source reading the sysfs tree described by `watch`.
    #[must_use]
    pub fn new(watch: ppssync_linux::WatchConfig) -> Self {
        Self {
            watch,
            watchers: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(target_os = "linux")]
impl EdgeSource for GpioEdgeSource {
    fn name(&self) -> &'static str {
        "gpio"
    }

    fn subscribe_rising_edge(&self, pin: u32, callback: EdgeCallback) -> Result<Subscription> {
        let watcher = ppssync_linux::GpioEdgeWatcher::watch(pin, &self.watch, move |at| {
            callback(DateTime::<Utc>::from(at));
        })
        .map_err(|e| Error::hardware_unavailable(self.name(), pin, e.to_string()))?;

        let subscription = next_subscription(pin);
        self.watchers.lock().insert(subscription.id, watcher);
        Ok(subscription)
    }

    fn unsubscribe(&self, handle: Subscription) -> Result<()> {
        match self.watchers.lock().remove(&handle.id) {
            Some(watcher) => watcher.stop(),
            None => warn!("GPIO subscription {} is not active", handle.id),
        }
        Ok(())
    }
}
