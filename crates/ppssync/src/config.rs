//! Configuration management for ppssync.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "ppssync";

/// Smallest interval window accepted by validation.
const MIN_PULSE_HISTORY_WINDOW: usize = 3;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `PPSSYNC_`, sections split on `__`)
/// 2. TOML config file at `~/.config/ppssync/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Synchronization engine configuration.
    pub sync: SyncConfig,
    /// Session document storage configuration.
    pub storage: StorageConfig,
    /// Pulse edge source configuration.
    pub hardware: HardwareConfig,
}

/// Synchronization engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Enable PPS synchronization. When false, `start()` does nothing.
    pub enabled: bool,
    /// GPIO pin (BCM numbering) carrying the PPS signal.
    pub pulse_source_pin: u32,
    /// Minimum spacing between two stored position fixes.
    pub min_position_fix_interval_seconds: u64,
    /// Interval between scheduled flushes of the session document.
    pub flush_interval_seconds: u64,
    /// Number of recent pulse intervals used for the stability metric.
    pub pulse_history_window: usize,
    /// Number of recent pulses kept in the ledger and persisted.
    pub recent_pulse_retention: usize,
    /// Depth of the queue between the edge callback and the worker.
    pub queue_capacity: usize,
    /// How long `stop()` waits for the worker before giving up on it.
    pub stop_timeout_ms: u64,
}

/// Session document storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for rig data.
    /// Defaults to `~/.local/share/ppssync`
    pub base_path: Option<PathBuf>,
    /// Directory under `base_path` holding session documents.
    pub sync_dir: String,
    /// `strftime` format used in session document names.
    pub timestamp_format: String,
    /// Group session documents into per-day subdirectories.
    pub use_timestamp_subdir: bool,
}

/// Which edge source drives the pulse clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSourceKind {
    /// The sysfs GPIO line named by `sync.pulse_source_pin` (Linux only).
    #[default]
    Gpio,
    /// A software pulse generator firing once per second.
    Simulated,
    /// No edge source; `start()` reports the hardware as unavailable.
    None,
}

impl std::fmt::Display for EdgeSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpio => write!(f, "gpio"),
            Self::Simulated => write!(f, "simulated"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Pulse edge source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Edge source backing the engine.
    pub source: EdgeSourceKind,
    /// Root of the sysfs GPIO tree.
    pub sysfs_root: PathBuf,
    /// Rising edges closer than this to the previous one are ignored.
    pub debounce_ms: u64,
    /// Sampling period of the GPIO value file.
    pub poll_interval_us: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pulse_source_pin: 18,
            min_position_fix_interval_seconds: 5,
            flush_interval_seconds: 60,
            pulse_history_window: 10,
            recent_pulse_retention: 100,
            queue_capacity: 64,
            stop_timeout_ms: 3_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: None, // Will be resolved to default at runtime
            sync_dir: "sync".to_string(),
            timestamp_format: "%Y%m%d_%H%M%S".to_string(),
            use_timestamp_subdir: true,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            source: EdgeSourceKind::Gpio,
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            debounce_ms: 10,
            poll_interval_us: 500,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("PPSSYNC_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;

        if sync.flush_interval_seconds == 0 {
            return Err(invalid("flush_interval_seconds must be greater than 0"));
        }

        if sync.pulse_history_window < MIN_PULSE_HISTORY_WINDOW {
            return Err(invalid(format!(
                "pulse_history_window ({}) must be at least {MIN_PULSE_HISTORY_WINDOW}",
                sync.pulse_history_window
            )));
        }

        if sync.recent_pulse_retention == 0 {
            return Err(invalid("recent_pulse_retention must be greater than 0"));
        }

        if sync.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than 0"));
        }

        if self.storage.timestamp_format.trim().is_empty() {
            return Err(invalid("timestamp_format must not be empty"));
        }

        if StrftimeItems::new(&self.storage.timestamp_format).any(|item| item == Item::Error) {
            return Err(invalid(format!(
                "invalid timestamp_format: {}",
                self.storage.timestamp_format
            )));
        }

        if self.storage.sync_dir.trim().is_empty() {
            return Err(invalid("sync_dir must not be empty"));
        }

        if self.hardware.poll_interval_us == 0 {
            return Err(invalid("poll_interval_us must be greater than 0"));
        }

        Ok(())
    }

    /// Get the base data path, resolving defaults if not set.
    #[must_use]
    pub fn base_path(&self) -> PathBuf {
        self.storage
            .base_path
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    /// Get the directory holding session documents.
    #[must_use]
    pub fn sync_dir(&self) -> PathBuf {
        self.base_path().join(&self.storage.sync_dir)
    }

    /// Resolve the session document path for a session started at `started_at`.
    ///
    /// Produces `<base>/<sync_dir>[/<YYYYMMDD>]/sync_<timestamp>.json`.
    #[must_use]
    pub fn session_document_path(&self, started_at: DateTime<Utc>) -> PathBuf {
        let mut dir = self.sync_dir();
        if self.storage.use_timestamp_subdir {
            dir = dir.join(started_at.format("%Y%m%d").to_string());
        }
        let stamp = started_at.format(&self.storage.timestamp_format);
        dir.join(format!("sync_{stamp}.json"))
    }

    /// Get the minimum position fix spacing as a Duration.
    #[must_use]
    pub fn min_position_fix_interval(&self) -> Duration {
        Duration::from_secs(self.sync.min_position_fix_interval_seconds)
    }

    /// Get the flush interval as a Duration.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.sync.flush_interval_seconds)
    }

    /// Get the worker join timeout as a Duration.
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.stop_timeout_ms)
    }

    /// Get the GPIO debounce as a Duration.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.hardware.debounce_ms)
    }

    /// Get the GPIO sampling period as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.hardware.poll_interval_us)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_sync_config() {
        let sync = SyncConfig::default();

        assert!(sync.enabled);
        assert_eq!(sync.pulse_source_pin, 18);
        assert_eq!(sync.min_position_fix_interval_seconds, 5);
        assert_eq!(sync.flush_interval_seconds, 60);
        assert_eq!(sync.pulse_history_window, 10);
        assert_eq!(sync.recent_pulse_retention, 100);
        assert_eq!(sync.stop_timeout_ms, 3_000);
    }

    #[test]
    fn test_default_storage_config() {
        let storage = StorageConfig::default();

        assert!(storage.base_path.is_none());
        assert_eq!(storage.sync_dir, "sync");
        assert_eq!(storage.timestamp_format, "%Y%m%d_%H%M%S");
        assert!(storage.use_timestamp_subdir);
    }

    #[test]
    fn test_default_hardware_config() {
        let hardware = HardwareConfig::default();

        assert_eq!(hardware.source, EdgeSourceKind::Gpio);
        assert_eq!(hardware.sysfs_root, PathBuf::from("/sys/class/gpio"));
        assert_eq!(hardware.debounce_ms, 10);
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_flush_interval() {
        let mut config = Config::default();
        config.sync.flush_interval_seconds = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("flush_interval_seconds"));
    }

    #[test]
    fn test_validate_small_history_window() {
        let mut config = Config::default();
        config.sync.pulse_history_window = 2;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("pulse_history_window"));
    }

    #[test]
    fn test_validate_zero_queue_capacity() {
        let mut config = Config::default();
        config.sync.queue_capacity = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("queue_capacity"));
    }

    #[test]
    fn test_validate_empty_timestamp_format() {
        let mut config = Config::default();
        config.storage.timestamp_format = "  ".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("timestamp_format"));
    }

    #[test]
    fn test_validate_malformed_timestamp_format() {
        let mut config = Config::default();
        config.storage.timestamp_format = "%Y%Q".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("invalid timestamp_format"));
    }

    #[test]
    fn test_session_document_path_with_subdir() {
        let mut config = Config::default();
        config.storage.base_path = Some(PathBuf::from("/data"));
        let started = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 5).unwrap();

        assert_eq!(
            config.session_document_path(started),
            PathBuf::from("/data/sync/20250314/sync_20250314_100005.json")
        );
    }

    #[test]
    fn test_session_document_path_flat() {
        let mut config = Config::default();
        config.storage.base_path = Some(PathBuf::from("/data"));
        config.storage.use_timestamp_subdir = false;
        let started = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 5).unwrap();

        assert_eq!(
            config.session_document_path(started),
            PathBuf::from("/data/sync/sync_20250314_100005.json")
        );
    }

    #[test]
    fn test_durations() {
        let config = Config::default();

        assert_eq!(config.min_position_fix_interval(), Duration::from_secs(5));
        assert_eq!(config.flush_interval(), Duration::from_secs(60));
        assert_eq!(config.stop_timeout(), Duration::from_secs(3));
        assert_eq!(config.debounce(), Duration::from_millis(10));
        assert_eq!(config.poll_interval(), Duration::from_micros(500));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("ppssync"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        // Loading from a nonexistent path should work (uses defaults)
        let result = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")));
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), Config::default());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[sync]
pulse_source_pin = 4
flush_interval_seconds = 30

[hardware]
source = "simulated"
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(path)).unwrap();
        assert_eq!(config.sync.pulse_source_pin, 4);
        assert_eq!(config.sync.flush_interval_seconds, 30);
        assert_eq!(config.sync.recent_pulse_retention, 100);
        assert_eq!(config.hardware.source, EdgeSourceKind::Simulated);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nqueue_capacity = 0\n").unwrap();

        let result = Config::load_from(Some(path));
        assert!(matches!(result, Err(Error::ConfigValidation { .. })));
    }

    #[test]
    fn test_edge_source_kind_display() {
        assert_eq!(EdgeSourceKind::Gpio.to_string(), "gpio");
        assert_eq!(EdgeSourceKind::Simulated.to_string(), "simulated");
        assert_eq!(EdgeSourceKind::None.to_string(), "none");
    }

    #[test]
    fn test_sync_config_deserialize() {
        let json = r#"{"enabled": false, "pulse_source_pin": 23}"#;
        let sync: SyncConfig = serde_json::from_str(json).unwrap();
        assert!(!sync.enabled);
        assert_eq!(sync.pulse_source_pin, 23);
        assert_eq!(sync.flush_interval_seconds, 60);
    }
}
