//! Persistence layer for ppssync.
//!
//! The [`PersistenceWriter`] turns a [`LedgerView`] into a [`SyncDocument`] and
//! writes it atomically (temporary file, fsync, rename). The caller takes the
//! view under the engine lock and releases the lock before calling
//! [`PersistenceWriter::flush`], so producers never wait on disk I/O.

pub mod document;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::ledger::LedgerView;

pub use document::SyncDocument;

/// What a flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The document was written.
    Written {
        /// Size of the document in bytes.
        bytes: usize,
    },
    /// The document matched the last successful write and was skipped.
    Unchanged,
}

/// Flush bookkeeping for status reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    /// Successful writes.
    pub writes: u64,
    /// Flushes skipped because nothing changed.
    pub skipped: u64,
    /// Failed writes.
    pub failures: u64,
    /// Time of the last successful write.
    pub last_success: Option<DateTime<Utc>>,
    /// Message of the most recent failure, cleared by the next success.
    pub last_error: Option<String>,
}

/// Writes the session document.
#[derive(Debug)]
pub struct PersistenceWriter {
    path: PathBuf,
    last_digest: Option<blake3::Hash>,
    stats: FlushStats,
}

impl PersistenceWriter {
    /// Create a writer for the session document at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_digest: None,
            stats: FlushStats::default(),
        }
    }

    /// Path of the session document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush bookkeeping so far.
    #[must_use]
    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Persist `view`.
    ///
    /// Unless `force` is set, a document identical to the last successful
    /// write is skipped. A failed write leaves the previous document in place
    /// and is retried by the next flush.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PersistenceIo`] if the document cannot be written.
    pub fn flush(&mut self, view: &LedgerView, force: bool) -> Result<FlushOutcome> {
        let document = SyncDocument::from(view);
        let bytes = serde_json::to_vec_pretty(&document)?;
        let digest = blake3::hash(&bytes);

        if !force && self.last_digest == Some(digest) {
            self.stats.skipped += 1;
            debug!("Sync document unchanged, skipping write");
            return Ok(FlushOutcome::Unchanged);
        }

        if let Err(source) = write_atomic(&self.path, &bytes) {
            self.stats.failures += 1;
            self.stats.last_error = Some(source.to_string());
            error!(
                "Error saving sync data to {}: {}",
                self.path.display(),
                source
            );
            return Err(Error::PersistenceIo {
                path: self.path.clone(),
                source,
            });
        }

        self.last_digest = Some(digest);
        self.stats.writes += 1;
        self.stats.last_success = Some(Utc::now());
        self.stats.last_error = None;

        let counts = view.counts();
        info!(
            "Saved sync data to {} ({} recordings, {} photos, {} fixes, {} pulses)",
            self.path.display(),
            counts.recordings,
            counts.photos,
            counts.position_fixes,
            counts.pulses
        );
        Ok(FlushOutcome::Written { bytes: bytes.len() })
    }
}

/// Write `bytes` to `path` so readers see either the old or the new file.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
