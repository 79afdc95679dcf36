use serde::{Deserialize, Serialize};

/// A configured BitTorrent client instance as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInstance {
    /// Stable instance identifier from configuration.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Whether the binding currently holds a working session.
    pub connected: bool,
    /// Last connection error, if any.
    pub last_error: Option<String>,
}

/// Live torrent counters from the client's torrent list.
///
/// The client is the single source of truth for these values; the engine
/// never caches them across ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentSummary {
    /// 40-hex info-hash.
    pub hash: String,
    /// Display name.
    pub name: String,
    /// Primary tracker URL.
    pub tracker: String,
    /// Client-reported state keyword (`uploading`, `stalledUP`, ...).
    pub state: String,
    /// Payload size, bytes.
    pub total_size: u64,
    /// Session-total uploaded bytes.
    pub uploaded: u64,
    /// Session-total downloaded bytes.
    pub downloaded: u64,
    /// Instantaneous upload speed, bytes/second.
    pub upspeed: f64,
    /// Instantaneous download speed, bytes/second.
    pub dlspeed: f64,
    /// Download completion in `[0, 1]`.
    pub progress: f64,
    /// Active upload limit, bytes/second (`<= 0` unlimited).
    pub up_limit: i64,
    /// Active download limit, bytes/second (`<= 0` unlimited).
    pub dl_limit: i64,
    /// Unix epoch the torrent was added at.
    pub added_on: f64,
}

impl TorrentSummary {
    /// Whether the client reports this torrent as worth controlling: moving
    /// data, or in one of the common active states.
    #[must_use]
    pub fn is_active(&self) -> bool {
        if self.upspeed > 0.0 || self.dlspeed > 0.0 {
            return true;
        }
        matches!(
            self.state.to_ascii_lowercase().as_str(),
            "up" | "uploading"
                | "downloading"
                | "stalledup"
                | "stalleddl"
                | "stalleddownloading"
                | "forcedup"
                | "forcedupload"
                | "forceddl"
                | "forceddownload"
                | "queuedup"
                | "queuedupload"
                | "queueddl"
                | "queueddownload"
        )
    }

    /// Convenience constructor for a seeding torrent, used across the tests.
    #[must_use]
    pub fn seeding(hash: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            name: name.into(),
            tracker: "https://tracker.example.org/announce".to_string(),
            state: "uploading".to_string(),
            total_size: 4 * 1024 * 1024 * 1024,
            uploaded: 0,
            downloaded: 4 * 1024 * 1024 * 1024,
            upspeed: 0.0,
            dlspeed: 0.0,
            progress: 1.0,
            up_limit: -1,
            dl_limit: -1,
            added_on: 0.0,
        }
    }
}

/// Heavy per-torrent properties, fetched on a phase-bound cadence under the
/// global RPC budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TorrentProperties {
    /// Seconds until the next tracker announce.
    pub reannounce_in: f64,
    /// Seconds the torrent has been seeding, when reported.
    pub seeding_time: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_covers_moving_and_named_states() {
        let mut summary = TorrentSummary::seeding("a".repeat(40), "demo");
        summary.state = "pausedUP".to_string();
        assert!(!summary.is_active());

        summary.upspeed = 10.0;
        assert!(summary.is_active());

        summary.upspeed = 0.0;
        summary.state = "stalledUP".to_string();
        assert!(summary.is_active());

        summary.state = "queuedDL".to_string();
        assert!(summary.is_active());
    }
}
