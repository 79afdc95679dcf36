#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! The seedpace limit engine.
//!
//! One long-running tick loop enumerates the active torrents on every
//! connected client, keeps a [`state::TorrentState`] per info-hash, drives
//! the control stack for each, and applies the resulting upload/download
//! caps back to the clients in batched RPCs. Two background workers resolve
//! best-effort site data (torrent id, peerlist announce time) without ever
//! blocking the tick.
//!
//! The tick itself is exposed as [`engine::LimitEngine::run_tick`], which
//! takes the current time as a parameter; the scenario tests drive simulated
//! clocks through it without sleeping.

pub mod dl_limit;
pub mod engine;
pub mod notify;
pub mod reannounce;
pub mod state;
pub mod status;

mod budget;
mod workers;

pub use engine::{EngineDeps, LimitEngine};
pub use status::{EngineStats, EngineStatus, TorrentView};

/// Smallest upload cap ever issued, bytes/second.
pub const MIN_LIMIT: i64 = 4_096;

/// Announce countdowns at or above this are treated as invalid, seconds.
pub const MAX_REANNOUNCE: f64 = 86_400.0;

/// Sentinel countdown when nothing has supplied one yet, seconds.
pub const UNKNOWN_TIME_LEFT: f64 = 9_999.0;

/// Minimum spacing between forced reannounces per torrent, seconds.
pub const REANNOUNCE_MIN_INTERVAL: f64 = 900.0;

/// Upload cap applied while stalling for a reannounce, KiB/s.
pub const REANNOUNCE_WAIT_LIMIT_KIB: i64 = 5_120;

/// Ring window consulted by the reannounce optimiser, seconds.
pub const REANNOUNCE_SPEED_WINDOW: f64 = 300.0;

/// Progress above which a near-announce torrent is never left uncapped.
pub const PROGRESS_PROTECT: f64 = 0.90;

/// Announce-interval estimate for torrents younger than a week, seconds.
pub const ANNOUNCE_INTERVAL_NEW: f64 = 1_800.0;

/// Announce-interval estimate for torrents younger than a month, seconds.
pub const ANNOUNCE_INTERVAL_WEEK: f64 = 2_700.0;

/// Announce-interval estimate for older torrents, seconds.
pub const ANNOUNCE_INTERVAL_OLD: f64 = 3_600.0;

/// Cooldown between site torrent-id searches per torrent, seconds.
pub const TID_SEARCH_INTERVAL: f64 = 60.0;

/// Negative-cache duration after a failed torrent-id search, seconds.
pub const TID_NOT_FOUND_CACHE: f64 = 3_600.0;

/// Cooldown between peerlist fetches per torrent, seconds.
pub const PEER_LIST_CHECK_INTERVAL: f64 = 300.0;

/// Estimate the tracker announce period from the torrent's age.
#[must_use]
pub fn estimate_announce_interval(time_ref: Option<f64>, now: f64) -> f64 {
    let Some(reference) = time_ref.filter(|&r| r > 0.0) else {
        return ANNOUNCE_INTERVAL_NEW;
    };
    let age = (now - reference).max(0.0);
    if age < 7.0 * 86_400.0 {
        ANNOUNCE_INTERVAL_NEW
    } else if age < 30.0 * 86_400.0 {
        ANNOUNCE_INTERVAL_WEEK
    } else {
        ANNOUNCE_INTERVAL_OLD
    }
}

/// Current Unix time in fractional seconds.
#[must_use]
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_interval_buckets_by_age() {
        let now = 100.0 * 86_400.0;
        assert_eq!(estimate_announce_interval(None, now), 1_800.0);
        assert_eq!(
            estimate_announce_interval(Some(now - 86_400.0), now),
            1_800.0
        );
        assert_eq!(
            estimate_announce_interval(Some(now - 10.0 * 86_400.0), now),
            2_700.0
        );
        assert_eq!(
            estimate_announce_interval(Some(now - 40.0 * 86_400.0), now),
            3_600.0
        );
        // A zero reference means "unknown", not 1970.
        assert_eq!(estimate_announce_interval(Some(0.0), now), 1_800.0);
    }
}
