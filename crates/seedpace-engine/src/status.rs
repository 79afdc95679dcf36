//! Inspection snapshots served to UIs and control bindings.

use seedpace_control::Phase;
use serde::Serialize;

use crate::state::TorrentState;

/// Lifetime counters plus live gauges.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
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
    /// Torrents controlled on the most recent tick.
    pub controlled: usize,
}

/// Engine-level status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Whether the tick loop is running.
    pub running: bool,
    /// Whether control is paused (all torrents uncapped).
    pub paused: bool,
    /// Session-wide target override, KiB/s.
    pub temp_target_kib: Option<i64>,
    /// Per-torrent summaries.
    pub torrents: Vec<TorrentView>,
}

/// Per-torrent snapshot, computed from the last tick's observations.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentView {
    /// 40-hex info-hash.
    pub hash: String,
    /// Display name.
    pub name: String,
    /// Owning client instance.
    pub client_id: Option<u32>,
    /// Attributed site.
    pub site_id: Option<u32>,
    /// Site torrent id, when resolved.
    pub tid: Option<i64>,
    /// Site promotion label, when resolved.
    pub promotion: Option<String>,
    /// Active phase.
    pub phase: Phase,
    /// Seconds to the next announce, when a valid countdown exists.
    pub time_left: Option<f64>,
    /// Source of the countdown.
    pub time_left_source: &'static str,
    /// Completed-cycle counter.
    pub cycle_index: u64,
    /// Whether cycle boundaries are synchronised.
    pub cycle_synced: bool,
    /// Learned announce period, seconds.
    pub cycle_interval: f64,
    /// Seconds since the cycle opened.
    pub cycle_elapsed: f64,
    /// Bytes uploaded inside the cycle (as of the last tick).
    pub cycle_uploaded: u64,
    /// Effective target, bytes/second.
    pub target_bps: i64,
    /// Bytes the cycle should total to land on target.
    pub target_upload: u64,
    /// Percent of the cycle target reached.
    pub target_progress: f64,
    /// Kalman projection of the cycle's final uploaded bytes.
    pub predicted_upload: u64,
    /// Kalman-filtered current speed, bytes/second.
    pub kalman_speed: f64,
    /// Last applied upload cap (`-1` uncapped, `-2` never issued).
    pub last_up_cap: i64,
    /// Reason tag of the last upload cap.
    pub last_limit_reason: String,
    /// Last applied download cap, KiB/s (`-1` uncapped).
    pub last_dl_cap_kib: i64,
    /// Whether the engine is stalling for an optimised reannounce.
    pub waiting_reannounce: bool,
}

impl TorrentView {
    /// Build a view from live state at `now`.
    #[must_use]
    pub fn from_state(state: &TorrentState, now: f64) -> Self {
        let tl_raw = state.time_left(now);
        let tl_valid = TorrentState::time_left_valid(tl_raw);
        let phase = state.phase_with(tl_raw);

        let cycle_elapsed = if state.cycle_start > 0.0 {
            state.cycle_elapsed(now)
        } else {
            0.0
        };
        let cycle_uploaded = if state.cycle_start > 0.0 {
            state.cycle_uploaded(state.last_total_uploaded)
        } else {
            0
        };

        let total_time = state.estimate_total_cycle(now, tl_raw);
        let target_upload = if state.target_bps > 0 {
            (state.target_bps as f64 * total_time) as u64
        } else {
            0
        };
        let target_progress = if target_upload > 0 {
            cycle_uploaded as f64 * 100.0 / target_upload as f64
        } else {
            0.0
        };
        let predicted_upload = if tl_valid {
            cycle_uploaded + state.controller.predict_upload(tl_raw) as u64
        } else {
            cycle_uploaded
        };

        Self {
            hash: state.hash.clone(),
            name: state.name.clone(),
            client_id: state.client_id,
            site_id: state.site_id,
            tid: state.tid,
            promotion: state.promotion.clone(),
            phase,
            time_left: tl_valid.then_some(tl_raw),
            time_left_source: state.time_left_source.as_str(),
            cycle_index: state.cycle_index,
            cycle_synced: state.cycle_synced,
            cycle_interval: state.cycle_interval,
            cycle_elapsed,
            cycle_uploaded,
            target_bps: state.target_bps,
            target_upload,
            target_progress,
            predicted_upload,
            kalman_speed: state.controller.kalman_speed(),
            last_up_cap: state.last_up_cap,
            last_limit_reason: state.last_limit_reason.clone(),
            last_dl_cap_kib: state.last_dl_cap_kib,
            waiting_reannounce: state.waiting_reannounce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedpace_control::ControlTuning;

    #[test]
    fn view_reports_cycle_progress() {
        let mut st = TorrentState::new("f".repeat(40), &ControlTuning::default());
        st.name = "demo".into();
        st.cycle_start = 1_000.0;
        st.cycle_synced = true;
        st.cycle_interval = 1_800.0;
        st.cycle_uploaded_at_start = 1_000;
        st.last_total_uploaded = 901_000;
        st.target_bps = 1_000;
        st.cached_time_left = 900.0;
        st.cache_timestamp = 1_900.0;

        let view = TorrentView::from_state(&st, 1_900.0);
        assert_eq!(view.phase, Phase::Steady);
        assert_eq!(view.time_left, Some(900.0));
        assert_eq!(view.cycle_uploaded, 900_000);
        // total = 900 elapsed + 900 left; target 1000 B/s -> 1.8 MB target.
        assert_eq!(view.target_upload, 1_800_000);
        assert!((view.target_progress - 50.0).abs() < 1e-9);
    }

    #[test]
    fn view_handles_unobserved_torrent() {
        let st = TorrentState::new("f".repeat(40), &ControlTuning::default());
        let view = TorrentView::from_state(&st, 0.0);
        assert_eq!(view.phase, Phase::Warmup);
        assert_eq!(view.time_left, None);
        assert_eq!(view.cycle_uploaded, 0);
        assert_eq!(view.target_upload, 0);
        assert_eq!(view.last_up_cap, -2);
    }
}
