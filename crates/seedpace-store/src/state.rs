use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use seedpace_control::PrecisionBias;
use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult};

const STATE_FILE: &str = "engine_state.json";

/// Scalar subset of a torrent's control state that survives restarts.
///
/// Estimator internals are deliberately absent: Kalman and PID state warm
/// back up from live measurements within seconds of a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedTorrent {
    /// Torrent display name.
    pub name: String,
    /// Primary tracker URL.
    pub tracker: String,
    /// Owning client instance.
    pub client_id: Option<u32>,
    /// Payload size, bytes.
    pub total_size: u64,
    /// Unix epoch the torrent was added at.
    pub added_at: f64,
    /// Unix epoch the control session started at.
    pub session_start: f64,
    /// Client uploaded counter at session start.
    pub session_uploaded_at_start: u64,
    /// Completed-cycle counter.
    pub cycle_index: u64,
    /// Unix epoch the current cycle opened at.
    pub cycle_start: f64,
    /// Client uploaded counter at cycle open.
    pub cycle_uploaded_at_start: u64,
    /// Learned announce period, seconds (0 until synchronised).
    pub cycle_interval: f64,
    /// Whether two consecutive jumps confirmed the period.
    pub cycle_synced: bool,
    /// Whether the current cycle was opened without an observed jump.
    pub cycle_synthetic: bool,
    /// Announce countdown observed on the previous tick.
    pub prev_time_left: f64,
    /// Number of countdown jumps seen so far.
    pub jump_count: u32,
    /// Unix epoch of the last observed jump.
    pub last_jump_time: f64,
    /// Cached announce countdown, seconds.
    pub cached_time_left: f64,
    /// Where the cached countdown came from (`client`, `site`, `estimated`).
    pub time_left_source: String,
    /// Attributed site.
    pub site_id: Option<u32>,
    /// Site torrent id, when resolved.
    pub tid: Option<i64>,
    /// Site promotion label, when resolved.
    pub promotion: Option<String>,
    /// Site publish time, Unix epoch, when resolved.
    pub publish_time: Option<f64>,
    /// Effective target at last save, bytes/second.
    pub target_bps: i64,
    /// Last applied upload cap, bytes/second (`-1` uncapped, `-2` never set).
    pub last_up_cap: i64,
    /// Last applied download cap, KiB/s (`-1` uncapped).
    pub last_dl_cap_kib: i64,
    /// Reason tag attached to the last upload cap.
    pub last_limit_reason: String,
    /// Whether a download cap was applied in the current cycle.
    pub dl_limited_this_cycle: bool,
    /// Whether a forced reannounce happened in the current cycle.
    pub reannounced_this_cycle: bool,
    /// Whether the engine is stalling upload for an optimised reannounce.
    pub waiting_reannounce: bool,
    /// Unix epoch of the last forced reannounce.
    pub last_reannounce: f64,
}

/// Lifetime counters for the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalCounters {
    /// Cycles completed under control.
    pub total_cycles: u64,
    /// Cycles with |ratio − 1| ≤ 0.03.
    pub success_cycles: u64,
    /// Cycles with |ratio − 1| ≤ 0.01.
    pub precision_cycles: u64,
    /// Bytes uploaded inside controlled cycles.
    pub total_limit_uploaded: u64,
    /// Unix epoch the engine first started.
    pub started_at: f64,
}

/// Everything the engine persists between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSnapshot {
    /// Per-torrent scalar state, keyed by info-hash.
    pub torrents: BTreeMap<String, PersistedTorrent>,
    /// Lifetime counters.
    pub counters: GlobalCounters,
    /// Process-global precision bias state.
    pub bias: PrecisionBias,
    /// Per-site cookie strings, opaque to the engine.
    pub cookies: BTreeMap<u32, String>,
    /// Opaque collaborator state (RSS fetch marks and the like).
    pub opaque: BTreeMap<String, serde_json::Value>,
}

/// Atomic-write JSON store for [`EngineSnapshot`].
#[derive(Debug, Clone)]
pub struct StateStore {
    base_dir: PathBuf,
}

impl StateStore {
    /// Store rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Ensure the state directory exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn ensure_initialized(&self) -> StoreResult<()> {
        if !self.base_dir.exists() {
            fs::create_dir_all(&self.base_dir).map_err(|source| StoreError::Io {
                path: self.base_dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.base_dir.join(STATE_FILE)
    }

    /// Load the snapshot; a missing file yields the empty default.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or decoded.
    /// Callers treat that as corruption: log and start empty.
    pub fn load(&self) -> StoreResult<EngineSnapshot> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(EngineSnapshot::default());
        }
        let raw = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| StoreError::Codec {
            path: path.display().to_string(),
            source,
        })
    }

    /// Persist the snapshot atomically (write to a sibling, then rename).
    ///
    /// # Errors
    ///
    /// Returns an error when encoding or any filesystem step fails.
    pub fn save(&self, snapshot: &EngineSnapshot) -> StoreResult<()> {
        self.ensure_initialized()?;
        let path = self.state_path();
        let json =
            serde_json::to_string_pretty(snapshot).map_err(|source| StoreError::Codec {
                path: path.display().to_string(),
                source,
            })?;
        let tmp = path.with_extension("json.tmp");
        write_file(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    fs::write(path, bytes).map_err(|source| StoreError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedpace_control::Phase;
    use tempfile::TempDir;

    fn sample_snapshot() -> EngineSnapshot {
        let mut snapshot = EngineSnapshot::default();
        let mut torrent = PersistedTorrent {
            name: "demo".into(),
            tracker: "https://alpha.example/announce".into(),
            client_id: Some(1),
            total_size: 4_096,
            added_at: 1_700_000_000.0,
            session_start: 1_700_000_100.0,
            session_uploaded_at_start: 10,
            cycle_index: 3,
            cycle_start: 1_700_001_000.0,
            cycle_uploaded_at_start: 999,
            cycle_interval: 1_800.0,
            cycle_synced: true,
            cycle_synthetic: false,
            prev_time_left: 432.1,
            jump_count: 4,
            last_jump_time: 1_700_001_000.0,
            cached_time_left: 500.0,
            time_left_source: "client".into(),
            site_id: Some(1),
            tid: Some(12_345),
            promotion: Some("free".into()),
            publish_time: None,
            target_bps: 52_428_800,
            last_up_cap: 1_048_576,
            last_dl_cap_kib: -1,
            last_limit_reason: "steady:1024K".into(),
            dl_limited_this_cycle: false,
            reannounced_this_cycle: true,
            waiting_reannounce: false,
            last_reannounce: 1_700_000_500.0,
        };
        snapshot
            .torrents
            .insert("a".repeat(40), torrent.clone());
        torrent.name = "other".into();
        torrent.cycle_index = 1;
        snapshot.torrents.insert("b".repeat(40), torrent);
        snapshot.counters = GlobalCounters {
            total_cycles: 12,
            success_cycles: 10,
            precision_cycles: 6,
            total_limit_uploaded: 123_456_789,
            started_at: 1_699_999_999.0,
        };
        for _ in 0..8 {
            snapshot.bias.record(1.02, Phase::Steady);
        }
        snapshot.cookies.insert(1, "cookie=value".into());
        snapshot
            .opaque
            .insert("rss.last_fetch.1".into(), serde_json::json!(1_700_000_000));
        snapshot
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path());
        let snapshot = store.load().expect("load");
        assert!(snapshot.torrents.is_empty());
        assert_eq!(snapshot.counters.total_cycles, 0);
    }

    #[test]
    fn save_load_save_is_byte_identical() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path());
        store.save(&sample_snapshot()).expect("first save");
        let first_bytes = fs::read(store.state_path()).expect("read");

        let reloaded = store.load().expect("reload");
        store.save(&reloaded).expect("second save");
        let second_bytes = fs::read(store.state_path()).expect("read again");

        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn reload_preserves_cycle_bookkeeping() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path());
        store.save(&sample_snapshot()).expect("save");
        let snapshot = store.load().expect("load");
        let torrent = &snapshot.torrents["a".repeat(40).as_str()];
        assert_eq!(torrent.cycle_index, 3);
        assert_eq!(torrent.cycle_uploaded_at_start, 999);
        assert!(torrent.cycle_synced);
        assert_eq!(torrent.last_up_cap, 1_048_576);
    }

    #[test]
    fn corrupt_file_surfaces_codec_error() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path());
        store.ensure_initialized().expect("init");
        fs::write(store.state_path(), b"{not json").expect("write");
        assert!(matches!(store.load(), Err(StoreError::Codec { .. })));
    }

    #[test]
    fn no_stale_tmp_file_left_behind() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path());
        store.save(&sample_snapshot()).expect("save");
        let tmp = store.state_path().with_extension("json.tmp");
        assert!(!tmp.exists());
    }
}
