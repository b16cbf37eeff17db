//! Tracing setup for the engine and the CLI.
//!
//! Log lines go to stderr so `ppssync run --json` can stream status records on
//! stdout. The filter comes from `PPSSYNC_LOG`, then `RUST_LOG`, then the
//! command-line verbosity.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding a filter for this crate's logs only.
pub const LOG_ENV: &str = "PPSSYNC_LOG";

/// How much the engine logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Lifecycle, registrations and flush failures.
    #[default]
    Normal,
    /// Adds session paths, skipped flushes and every tenth pulse.
    Verbose,
    /// Every pulse and every edge.
    Trace,
}

impl Verbosity {
    /// Map `-q` and the count of `-v` flags to a verbosity. `-q` wins.
    #[must_use]
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Trace,
        }
    }

    /// Filter directives for this verbosity, covering the engine and the GPIO
    /// watcher. Other crates stay at their defaults (off).
    #[must_use]
    pub fn directives(self) -> &'static str {
        match self {
            Self::Quiet => "ppssync=error,ppssync_linux=error",
            Self::Normal => "ppssync=info,ppssync_linux=info",
            Self::Verbose => "ppssync=debug,ppssync_linux=debug",
            Self::Trace => "ppssync=trace,ppssync_linux=trace",
        }
    }
}

fn env_filter(verbosity: Verbosity) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directives()))
}

/// Install the global subscriber. Later calls are ignored.
///
/// ```no_run
/// use ppssync::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::from_flags(false, 1));
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity == Verbosity::Trace)
        .with_thread_names(verbosity != Verbosity::Normal);

    let _ = tracing_subscriber::registry()
        .with(env_filter(verbosity))
        .with(layer)
        .try_init();
}

/// Test subscriber: warnings only unless `PPSSYNC_LOG` says otherwise.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| "warn".into()))
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}
