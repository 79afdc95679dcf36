use serde::Deserialize;

use seedpace_client::{TorrentProperties, TorrentSummary};

/// One entry of `/api/v2/torrents/info`.
#[derive(Debug, Clone, Deserialize)]
pub struct QbitTorrentInfo {
    /// 40-hex info-hash.
    pub hash: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Primary tracker URL (empty unless a tracker responded).
    #[serde(default)]
    pub tracker: String,
    /// Client state keyword.
    #[serde(default)]
    pub state: String,
    /// Payload size, bytes.
    #[serde(default)]
    pub total_size: i64,
    /// Session-total uploaded bytes.
    #[serde(default)]
    pub uploaded: i64,
    /// Session-total downloaded bytes.
    #[serde(default)]
    pub downloaded: i64,
    /// Instantaneous upload speed, bytes/second.
    #[serde(default)]
    pub upspeed: f64,
    /// Instantaneous download speed, bytes/second.
    #[serde(default)]
    pub dlspeed: f64,
    /// Completion in `[0, 1]`.
    #[serde(default)]
    pub progress: f64,
    /// Active upload limit, bytes/second (`-1` unlimited).
    #[serde(default = "unlimited")]
    pub up_limit: i64,
    /// Active download limit, bytes/second (`-1` unlimited).
    #[serde(default = "unlimited")]
    pub dl_limit: i64,
    /// Unix epoch the torrent was added at.
    #[serde(default)]
    pub added_on: i64,
}

const fn unlimited() -> i64 {
    -1
}

impl From<QbitTorrentInfo> for TorrentSummary {
    fn from(info: QbitTorrentInfo) -> Self {
        Self {
            hash: info.hash,
            name: info.name,
            tracker: info.tracker,
            state: info.state,
            total_size: info.total_size.max(0) as u64,
            uploaded: info.uploaded.max(0) as u64,
            downloaded: info.downloaded.max(0) as u64,
            upspeed: info.upspeed.max(0.0),
            dlspeed: info.dlspeed.max(0.0),
            progress: info.progress.clamp(0.0, 1.0),
            up_limit: info.up_limit,
            dl_limit: info.dl_limit,
            added_on: info.added_on.max(0) as f64,
        }
    }
}

/// Subset of `/api/v2/torrents/properties`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QbitTorrentProperties {
    /// Seconds until the next announce.
    #[serde(default)]
    pub reannounce: f64,
    /// Seconds spent seeding.
    #[serde(default)]
    pub seeding_time: Option<f64>,
}

impl From<QbitTorrentProperties> for TorrentProperties {
    fn from(props: QbitTorrentProperties) -> Self {
        Self {
            reannounce_in: props.reannounce,
            seeding_time: props.seeding_time,
        }
    }
}

/// Subset of `/api/v2/sync/maindata`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QbitMainData {
    /// Server-level gauges.
    #[serde(default)]
    pub server_state: QbitServerState,
}

/// Server-level gauges inside the maindata payload.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct QbitServerState {
    /// Free bytes on the default save-path volume.
    #[serde(default)]
    pub free_space_on_disk: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torrent_info_decodes_and_converts() {
        let raw = r#"{
            "hash": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "name": "demo",
            "tracker": "https://alpha.example/announce",
            "state": "uploading",
            "total_size": 1073741824,
            "uploaded": 2048,
            "downloaded": 1073741824,
            "upspeed": 123456.0,
            "dlspeed": 0,
            "progress": 1.0,
            "up_limit": -1,
            "dl_limit": 0,
            "added_on": 1700000000
        }"#;
        let info: QbitTorrentInfo = serde_json::from_str(raw).expect("decode");
        let summary = TorrentSummary::from(info);
        assert_eq!(summary.hash.len(), 40);
        assert_eq!(summary.total_size, 1_073_741_824);
        assert_eq!(summary.up_limit, -1);
        assert!(summary.is_active());
    }

    #[test]
    fn missing_fields_default_sanely() {
        let info: QbitTorrentInfo =
            serde_json::from_str(r#"{"hash": "bbbb"}"#).expect("decode");
        assert_eq!(info.up_limit, -1);
        assert_eq!(info.dl_limit, -1);
        let summary = TorrentSummary::from(info);
        assert_eq!(summary.uploaded, 0);
        assert_eq!(summary.added_on, 0.0);
    }

    #[test]
    fn negative_counters_clamp_to_zero() {
        let info: QbitTorrentInfo =
            serde_json::from_str(r#"{"hash": "cccc", "uploaded": -5, "upspeed": -1.0}"#)
                .expect("decode");
        let summary = TorrentSummary::from(info);
        assert_eq!(summary.uploaded, 0);
        assert_eq!(summary.upspeed, 0.0);
    }

    #[test]
    fn properties_decode() {
        let props: QbitTorrentProperties =
            serde_json::from_str(r#"{"reannounce": 432, "seeding_time": 10}"#).expect("decode");
        assert_eq!(props.reannounce, 432.0);
        let converted = TorrentProperties::from(props);
        assert_eq!(converted.reannounce_in, 432.0);
    }

    #[test]
    fn maindata_decodes_free_space() {
        let data: QbitMainData = serde_json::from_str(
            r#"{"server_state": {"free_space_on_disk": 1234567890}, "torrents": {}}"#,
        )
        .expect("decode");
        assert_eq!(data.server_state.free_space_on_disk, 1_234_567_890);
    }
}
