//! Linux-specific GPIO support for ppssync
//!
//! This crate watches a sysfs GPIO line for rising edges and hands each edge's
//! wall-clock time to a caller-supplied callback running on a dedicated thread.

#![cfg(target_os = "linux")]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Default sysfs GPIO root.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

/// Errors raised while claiming or releasing a GPIO line.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The line could not be exported or its value file is unreadable.
    #[error("GPIO pin {pin} is unavailable: {source}")]
    PinUnavailable {
        /// BCM pin number.
        pin: u32,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The line exists but could not be configured as a rising-edge input.
    #[error("failed to configure GPIO pin {pin} ({attribute}): {source}")]
    Configure {
        /// BCM pin number.
        pin: u32,
        /// The sysfs attribute being written.
        attribute: &'static str,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The watcher thread could not be spawned.
    #[error("failed to spawn watcher thread for GPIO pin {pin}: {source}")]
    Spawn {
        /// BCM pin number.
        pin: u32,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Tuning for a [`GpioEdgeWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Root of the sysfs GPIO tree.
    pub sysfs_root: PathBuf,
    /// Minimum spacing between two accepted rising edges.
    pub debounce: Duration,
    /// Sampling period of the value file.
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            debounce: Duration::from_millis(10),
            poll_interval: Duration::from_micros(500),
        }
    }
}

/// Watches one sysfs GPIO line and reports rising edges.
///
/// The callback runs on the watcher thread and must not block.
#[derive(Debug)]
pub struct GpioEdgeWatcher {
    pin: u32,
    root: PathBuf,
    exported_here: bool,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl GpioEdgeWatcher {
    /// Claim `pin` as an input and start reporting rising edges to `on_rising`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin cannot be exported, configured, or read.
    pub fn watch<F>(pin: u32, config: &WatchConfig, on_rising: F) -> Result<Self, WatchError>
    where
        F: Fn(SystemTime) + Send + 'static,
    {
        let root = config.sysfs_root.clone();
        let line_dir = root.join(format!("gpio{pin}"));

        let exported_here = if line_dir.exists() {
            false
        } else {
            write_attr(&root.join("export"), &pin.to_string())
                .map_err(|source| WatchError::PinUnavailable { pin, source })?;
            true
        };

        write_attr(&line_dir.join("direction"), "in").map_err(|source| {
            WatchError::Configure {
                pin,
                attribute: "direction",
                source,
            }
        })?;

        // Only interrupt-capable lines expose `edge`; sampling works without it.
        match write_attr(&line_dir.join("edge"), "rising") {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("GPIO pin {} has no edge attribute", pin);
            }
            Err(source) => {
                return Err(WatchError::Configure {
                    pin,
                    attribute: "edge",
                    source,
                })
            }
        }

        let value_path = line_dir.join("value");
        let initial = read_level(&value_path)
            .map_err(|source| WatchError::PinUnavailable { pin, source })?;

        let stop = Arc::new(AtomicBool::new(false));
        let sampler = Sampler {
            value_path,
            debounce: config.debounce,
            poll_interval: config.poll_interval,
            stop: Arc::clone(&stop),
        };

        let thread = thread::Builder::new()
            .name(format!("gpio{pin}-edge"))
            .spawn(move || sampler.run(initial, &on_rising))
            .map_err(|source| WatchError::Spawn { pin, source })?;

        info!("Watching GPIO pin {} for rising edges", pin);
        Ok(Self {
            pin,
            root,
            exported_here,
            stop,
            thread: Some(thread),
        })
    }

    /// The watched pin.
    #[must_use]
    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Stop the watcher thread and release the line.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("GPIO pin {} watcher thread panicked", self.pin);
            }
            if self.exported_here {
                if let Err(err) = write_attr(&self.root.join("unexport"), &self.pin.to_string())
                {
                    warn!("Failed to unexport GPIO pin {}: {}", self.pin, err);
                }
            }
            info!("Released GPIO pin {}", self.pin);
        }
    }
}

impl Drop for GpioEdgeWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Sampler {
    value_path: PathBuf,
    debounce: Duration,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl Sampler {
    fn run(&self, initial: bool, on_rising: &dyn Fn(SystemTime)) {
        let mut level = initial;
        let mut last_edge: Option<Instant> = None;
        let mut read_failing = false;

        while !self.stop.load(Ordering::SeqCst) {
            match read_level(&self.value_path) {
                Ok(current) => {
                    read_failing = false;
                    if current && !level {
                        let now = Instant::now();
                        let settled =
                            last_edge.map_or(true, |t| now.duration_since(t) >= self.debounce);
                        if settled {
                            last_edge = Some(now);
                            on_rising(SystemTime::now());
                        }
                    }
                    level = current;
                }
                Err(err) => {
                    if !read_failing {
                        warn!("Failed to read {}: {}", self.value_path.display(), err);
                        read_failing = true;
                    }
                }
            }
            thread::sleep(self.poll_interval);
        }
    }
}

fn write_attr(path: &Path, value: &str) -> io::Result<()> {
    fs::write(path, value)
}

fn read_level(path: &Path) -> io::Result<bool> {
    let raw = fs::read_to_string(path)?;
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected GPIO level {other:?}"),
        )),
    }
}

/// Name of the edge-detection backend this crate provides.
#[must_use]
pub fn platform_name() -> &'static str {
    "Linux (sysfs GPIO)"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn fake_line(root: &Path, pin: u32, level: &str) -> PathBuf {
        let dir = root.join(format!("gpio{pin}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "out").unwrap();
        fs::write(dir.join("edge"), "none").unwrap();
        fs::write(dir.join("value"), level).unwrap();
        dir
    }

    fn fast_config(root: &Path) -> WatchConfig {
        WatchConfig {
            sysfs_root: root.to_path_buf(),
            debounce: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_platform_name() {
        assert_eq!(platform_name(), "Linux (sysfs GPIO)");
    }

    #[test]
    fn test_default_watch_config() {
        let config = WatchConfig::default();
        assert_eq!(config.sysfs_root, PathBuf::from("/sys/class/gpio"));
        assert_eq!(config.debounce, Duration::from_millis(10));
    }

    #[test]
    fn test_read_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");

        fs::write(&path, "1\n").unwrap();
        assert!(read_level(&path).unwrap());

        fs::write(&path, "0\n").unwrap();
        assert!(!read_level(&path).unwrap());

        fs::write(&path, "x").unwrap();
        assert!(read_level(&path).is_err());
    }

    #[test]
    fn test_watch_configures_line() {
        let root = tempfile::tempdir().unwrap();
        let line = fake_line(root.path(), 18, "0");

        let watcher = GpioEdgeWatcher::watch(18, &fast_config(root.path()), |_| {}).unwrap();
        assert_eq!(watcher.pin(), 18);
        assert_eq!(fs::read_to_string(line.join("direction")).unwrap(), "in");
        assert_eq!(fs::read_to_string(line.join("edge")).unwrap(), "rising");
        watcher.stop();
    }

    #[test]
    fn test_watch_missing_line_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        // No export file and no gpio dir: nothing to claim.
        let absent = root.path().join("absent");
        let result = GpioEdgeWatcher::watch(4, &fast_config(&absent), |_| {});
        assert!(matches!(
            result,
            Err(WatchError::PinUnavailable { pin: 4, .. })
        ));
    }

    #[test]
    fn test_watch_reports_rising_edge() {
        let root = tempfile::tempdir().unwrap();
        let line = fake_line(root.path(), 18, "0");
        let (tx, rx) = mpsc::channel();

        let watcher = GpioEdgeWatcher::watch(18, &fast_config(root.path()), move |at| {
            let _ = tx.send(at);
        })
        .unwrap();

        fs::write(line.join("value"), "1").unwrap();
        let edge = rx.recv_timeout(Duration::from_secs(2));
        assert!(edge.is_ok());

        watcher.stop();
    }

    #[test]
    fn test_level_high_at_start_is_not_an_edge() {
        let root = tempfile::tempdir().unwrap();
        fake_line(root.path(), 18, "1");
        let (tx, rx) = mpsc::channel::<SystemTime>();

        let watcher = GpioEdgeWatcher::watch(18, &fast_config(root.path()), move |at| {
            let _ = tx.send(at);
        })
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        watcher.stop();
    }
}
