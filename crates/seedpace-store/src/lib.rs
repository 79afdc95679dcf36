#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Durable state for the seedpace engine.
//!
//! Two files under the state directory:
//!
//! - `engine_state.json`: the per-torrent scalar state, global counters,
//!   precision-bias state and opaque collaborator blobs, written atomically
//!   (write-then-rename) on the engine's save cadence and at shutdown.
//! - `cycle_history.jsonl`: an append log of completed announce cycles,
//!   bounded by rewriting once it grows past twice the configured limit.
//!
//! Serialisation uses ordered maps and fixed field order so that a
//! load-then-save round trip is byte-identical.

mod history;
mod state;

pub use history::{CycleRecord, HistoryStore};
pub use state::{EngineSnapshot, GlobalCounters, PersistedTorrent, StateStore};

/// Errors raised by the stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("store io failed at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Payload could not be encoded or decoded.
    #[error("store codec failed at {path}: {source}")]
    Codec {
        /// Offending path.
        path: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
