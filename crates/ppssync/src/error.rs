//! Error types for ppssync.
//!
//! This module defines the crate-wide error type. Registration misuse is
//! reported by the ledger as a [`LedgerError`](crate::ledger::LedgerError) and
//! never leaves the engine.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for ppssync operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Hardware Errors ===
    /// The pulse edge source could not be claimed.
    #[error("PPS edge source '{source_name}' unavailable on pin {pin}: {message}")]
    HardwareUnavailable {
        /// Name of the edge source.
        source_name: &'static str,
        /// Pin that was requested.
        pin: u32,
        /// Description of what went wrong.
        message: String,
    },

    /// The pulse queue was full and a pulse was dropped.
    #[error("pulse queue full (capacity {capacity}), pulse dropped")]
    QueueOverflow {
        /// Capacity of the queue.
        capacity: usize,
    },

    // === Persistence Errors ===
    /// Writing the session document failed.
    #[error("failed to persist sync document to {path}: {source}")]
    PersistenceIo {
        /// Path of the session document.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Reading a session document failed.
    #[error("failed to load sync document from {path}: {source}")]
    DocumentLoad {
        /// Path of the session document.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for ppssync operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a hardware-unavailable error.
    #[must_use]
    pub fn hardware_unavailable(
        source_name: &'static str,
        pin: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::HardwareUnavailable {
            source_name,
            pin,
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error means the edge source could not be claimed.
    #[must_use]
    pub fn is_hardware_unavailable(&self) -> bool {
        matches!(self, Self::HardwareUnavailable { .. })
    }
}
