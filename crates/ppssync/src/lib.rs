//! `ppssync` - PPS-disciplined event timeline
//!
//! This library correlates camera recordings, photos and GNSS fixes with a
//! logical clock driven by a hardware pulse-per-second signal, and persists the
//! resulting timeline as one JSON document per session.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod hardware;
pub mod ledger;
pub mod logging;
pub mod manager;
pub mod storage;

pub use clock::{ClockSnapshot, PulseEvent, Stability};
pub use config::Config;
pub use error::{Error, Result};
pub use hardware::{
    edge_source_from_config, platform_name, EdgeCallback, EdgeSource, ManualEdgeSource,
    SimulatedEdgeSource, Subscription, UnavailableEdgeSource,
};
pub use ledger::{EventCounts, EventKind, LedgerError, Position};
pub use logging::init_logging;
pub use manager::{SyncManager, SyncState, SyncStatus};
pub use storage::{FlushOutcome, FlushStats, PersistenceWriter, SyncDocument};
