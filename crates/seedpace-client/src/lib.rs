#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Client adapter contract between the limit engine and BitTorrent clients.
//!
//! The engine needs a deliberately narrow surface: enumerate connected
//! instances, list active torrents with live counters, fetch per-torrent
//! properties (seconds to the next announce), set upload/download limits for
//! a batch of hashes in one call, force a reannounce, and read free disk
//! space. Anything richer belongs to the concrete binding crates.
//!
//! [`StubClient`] is the in-memory implementation the engine tests script
//! their scenarios against.

mod model;
mod stub;

pub use model::{ClientInstance, TorrentProperties, TorrentSummary};
pub use stub::{LimitCall, StubClient};

use async_trait::async_trait;

/// Errors surfaced by client bindings.
///
/// The engine treats every variant as transient: the failing call is skipped
/// for the current tick and retried implicitly on the next one.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The instance is not connected or not configured.
    #[error("client instance {0} unavailable")]
    Unavailable(u32),
    /// The client rejected the credentials.
    #[error("authentication failed for client instance {0}")]
    Auth(u32),
    /// Transport-level failure talking to the client.
    #[error("client rpc failed: {0}")]
    Rpc(String),
    /// The client answered with a payload the binding could not decode.
    #[error("client response decode failed: {0}")]
    Decode(String),
}

/// Result alias for client adapter calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Narrow interface onto a BitTorrent client RPC, as required by the limit
/// engine. Rate-limit values are bytes/second; `0` and negative values mean
/// unlimited.
#[async_trait]
pub trait ClientAdapter: Send + Sync {
    /// Enumerate currently connected client instances.
    async fn instances(&self) -> Vec<ClientInstance>;

    /// List torrents the client reports as active.
    async fn active_torrents(&self, client_id: u32) -> ClientResult<Vec<TorrentSummary>>;

    /// Fetch the heavy per-torrent properties (announce countdown).
    async fn properties(&self, client_id: u32, hash: &str) -> ClientResult<TorrentProperties>;

    /// Apply one upload limit to a batch of hashes in a single call.
    async fn set_upload_limit(
        &self,
        client_id: u32,
        hashes: &[String],
        bps: i64,
    ) -> ClientResult<()>;

    /// Apply one download limit to a batch of hashes in a single call.
    async fn set_download_limit(
        &self,
        client_id: u32,
        hashes: &[String],
        bps: i64,
    ) -> ClientResult<()>;

    /// Force a tracker reannounce for a torrent.
    async fn reannounce(&self, client_id: u32, hash: &str) -> ClientResult<()>;

    /// Free disk space on the instance, bytes.
    async fn free_space(&self, client_id: u32) -> ClientResult<u64>;

    /// Client application version string.
    async fn version(&self, client_id: u32) -> ClientResult<String>;
}
