//! Orka reflector: mirrors a remote, versioned collection into a local store
//! using an initial list followed by a watch, with periodic resync and
//! reconnection.

#![forbid(unsafe_code)]

use std::time::Duration;

use orka_core::{ListWatchError, Status};
use orka_store::StoreError;

mod config;
mod reflector;
mod resync;
mod version;

pub use config::ReflectorConfig;
pub use reflector::{new_namespace_keyed_indexer_and_reflector, Reflector, SessionEnd};
pub use version::LastSyncedVersion;

/// Why a list+watch iteration failed. None of these stop the reflector; the
/// next iteration starts after the configured period.
#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    #[error("failed to list: {0}")]
    List(#[source] ListWatchError),
    #[error("unable to sync list result: {0}")]
    Sync(#[source] StoreError),
    #[error("failed to watch: {0}")]
    WatchOpen(#[source] ListWatchError),
    #[error("watch ended with error event: {0}")]
    WatchEvent(Status),
    #[error("very short watch: closed after {elapsed:?} with no items received")]
    VeryShortWatch { elapsed: Duration },
}
