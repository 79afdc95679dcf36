#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! qBittorrent WebUI API binding for the seedpace limit engine.
//!
//! Implements the narrow [`seedpace_client::ClientAdapter`] contract over
//! one or more qBittorrent instances. Sessions authenticate through the
//! cookie-based `/api/v2/auth/login` endpoint; a request that comes back
//! `403` triggers one transparent re-login and retry, after which the error
//! is surfaced and the engine skips the call for the tick.

mod client;
mod manager;
mod model;

pub use client::QbitClient;
pub use manager::QbitManager;
pub use model::{QbitMainData, QbitServerState, QbitTorrentInfo, QbitTorrentProperties};
