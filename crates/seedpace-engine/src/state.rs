//! Per-torrent cycle bookkeeping and phase classification.

use seedpace_control::{CalcDebug, ControlTuning, Phase, RateController, SampleRing};
use seedpace_store::PersistedTorrent;

use crate::{MAX_REANNOUNCE, UNKNOWN_TIME_LEFT, estimate_announce_interval};

/// Where the cached announce countdown came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeLeftSource {
    /// Nothing has supplied a countdown yet.
    #[default]
    Unknown,
    /// Client RPC (`properties.reannounce`).
    Client,
    /// Site peerlist.
    Site,
    /// Derived from the estimated announce interval.
    Estimated,
}

impl TimeLeftSource {
    /// Stable string used in persistence and inspection surfaces.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Client => "client",
            Self::Site => "site",
            Self::Estimated => "estimated",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "client" => Self::Client,
            "site" => Self::Site,
            "estimated" => Self::Estimated,
            _ => Self::Unknown,
        }
    }
}

/// Control state for one torrent, exclusively owned by the limit engine.
///
/// Background workers mutate only the site-resolved subset (`tid`,
/// `promotion`, `publish_time`, `tid_not_found_until`, `last_announce_time`,
/// `site_uploaded`) under the engine's map lock.
#[derive(Debug, Clone)]
pub struct TorrentState {
    /// 40-hex info-hash.
    pub hash: String,
    /// Display name, refreshed from the client each tick.
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

    /// Completed-cycle counter, monotonically increasing.
    pub cycle_index: u64,
    /// Unix epoch the current cycle opened at (0 until first observation).
    pub cycle_start: f64,
    /// Client uploaded counter at cycle open.
    pub cycle_uploaded_at_start: u64,
    /// Learned announce period, seconds (0 until synchronised).
    pub cycle_interval: f64,
    /// Whether two consecutive jumps confirmed the period.
    pub cycle_synced: bool,
    /// Whether the current cycle was opened without an observed jump.
    pub cycle_synthetic: bool,
    /// Countdown observed on the previous tick.
    pub prev_time_left: f64,
    /// Number of countdown jumps seen so far.
    pub jump_count: u32,
    /// Unix epoch of the last observed jump.
    pub last_jump_time: f64,

    /// Cached announce countdown, seconds.
    pub cached_time_left: f64,
    /// When the countdown was cached.
    pub cache_timestamp: f64,
    /// Source of the cached countdown.
    pub time_left_source: TimeLeftSource,
    /// When the heavy properties RPC last ran for this torrent.
    pub last_props: f64,

    /// Attributed site.
    pub site_id: Option<u32>,
    /// Site torrent id, when resolved.
    pub tid: Option<i64>,
    /// Site promotion label, when resolved.
    pub promotion: Option<String>,
    /// Site publish time, Unix epoch, when resolved.
    pub publish_time: Option<f64>,
    /// Whether a torrent-id search completed (either way).
    pub tid_searched: bool,
    /// When the last torrent-id search was enqueued.
    pub tid_search_time: f64,
    /// Negative cache: no new search before this instant.
    pub tid_not_found_until: f64,
    /// When the peerlist was last fetched.
    pub last_peer_check: f64,
    /// Last announce epoch reported by the site peerlist.
    pub last_announce_time: Option<f64>,
    /// Uploaded bytes as accounted by the site.
    pub site_uploaded: Option<u64>,

    /// Effective target, bytes/second.
    pub target_bps: i64,
    /// Last applied upload cap (`-1` uncapped, `-2` never issued).
    pub last_up_cap: i64,
    /// Last applied download cap, KiB/s (`-1` uncapped).
    pub last_dl_cap_kib: i64,
    /// Reason tag of the last upload cap.
    pub last_limit_reason: String,
    /// Whether a download cap was applied in this cycle.
    pub dl_limited_this_cycle: bool,
    /// Whether a forced reannounce happened in this cycle.
    pub reannounced_this_cycle: bool,
    /// Whether the engine is stalling upload to optimise the next announce.
    pub waiting_reannounce: bool,
    /// Unix epoch of the last forced reannounce.
    pub last_reannounce: f64,
    /// Whether the monitor-start notification went out.
    pub monitor_notified: bool,
    /// Last tick this hash appeared in a client's torrent list.
    pub last_seen: f64,
    /// Uploaded counter as of the last tick (display only, never control).
    pub last_total_uploaded: u64,

    /// Embedded rate controller (Kalman + windows + PID + quantiser).
    pub controller: RateController,
    /// Raw up/dl sample ring for the optimiser and the samples API.
    pub ring: SampleRing,
    /// Debug values of the last cap computation.
    pub last_debug: CalcDebug,
}

impl TorrentState {
    /// Fresh state for a newly observed torrent.
    #[must_use]
    pub fn new(hash: impl Into<String>, tuning: &ControlTuning) -> Self {
        Self {
            hash: hash.into(),
            name: String::new(),
            tracker: String::new(),
            client_id: None,
            total_size: 0,
            added_at: 0.0,
            session_start: 0.0,
            session_uploaded_at_start: 0,
            cycle_index: 0,
            cycle_start: 0.0,
            cycle_uploaded_at_start: 0,
            cycle_interval: 0.0,
            cycle_synced: false,
            cycle_synthetic: false,
            prev_time_left: 0.0,
            jump_count: 0,
            last_jump_time: 0.0,
            cached_time_left: 0.0,
            cache_timestamp: 0.0,
            time_left_source: TimeLeftSource::Unknown,
            last_props: 0.0,
            site_id: None,
            tid: None,
            promotion: None,
            publish_time: None,
            tid_searched: false,
            tid_search_time: 0.0,
            tid_not_found_until: 0.0,
            last_peer_check: 0.0,
            last_announce_time: None,
            site_uploaded: None,
            target_bps: 0,
            last_up_cap: -2,
            last_dl_cap_kib: -1,
            last_limit_reason: String::new(),
            dl_limited_this_cycle: false,
            reannounced_this_cycle: false,
            waiting_reannounce: false,
            last_reannounce: 0.0,
            monitor_notified: false,
            last_seen: 0.0,
            last_total_uploaded: 0,
            controller: RateController::new(tuning),
            ring: SampleRing::new(),
            last_debug: CalcDebug::default(),
        }
    }

    /// Estimated announce period for this torrent, seconds.
    #[must_use]
    pub fn announce_interval(&self, now: f64) -> f64 {
        let reference = self
            .publish_time
            .or_else(|| (self.added_at > 0.0).then_some(self.added_at));
        estimate_announce_interval(reference, now)
    }

    /// Seconds until the next tracker announce.
    ///
    /// Priority: a site-supplied last-announce epoch, then the decayed cached
    /// countdown, then the unknown sentinel.
    #[must_use]
    pub fn time_left(&self, now: f64) -> f64 {
        if let Some(last_announce) = self.last_announce_time.filter(|&at| at > 0.0) {
            let next = last_announce + self.announce_interval(now);
            return (next - now).max(0.0);
        }
        if self.cache_timestamp <= 0.0 {
            return UNKNOWN_TIME_LEFT;
        }
        (self.cached_time_left - (now - self.cache_timestamp)).max(0.0)
    }

    /// Whether a countdown value is usable.
    #[must_use]
    pub fn time_left_valid(time_left: f64) -> bool {
        time_left > 0.0 && time_left < MAX_REANNOUNCE
    }

    /// Phase for a known countdown.
    #[must_use]
    pub fn phase_with(&self, time_left: f64) -> Phase {
        Phase::classify(self.cycle_synced, time_left)
    }

    /// Phase at `now`.
    #[must_use]
    pub fn phase(&self, now: f64) -> Phase {
        self.phase_with(self.time_left(now))
    }

    /// Seconds since the current cycle opened.
    #[must_use]
    pub fn cycle_elapsed(&self, now: f64) -> f64 {
        (now - self.cycle_start).max(0.0)
    }

    /// Bytes uploaded since the current cycle opened.
    #[must_use]
    pub fn cycle_uploaded(&self, total_uploaded: u64) -> u64 {
        total_uploaded.saturating_sub(self.cycle_uploaded_at_start)
    }

    /// Best estimate of the full cycle length, seconds.
    #[must_use]
    pub fn estimate_total_cycle(&self, now: f64, time_left: f64) -> f64 {
        let elapsed = self.cycle_elapsed(now);
        if Self::time_left_valid(time_left) {
            return (elapsed + time_left).max(1.0);
        }
        if self.cycle_synced && self.cycle_interval > 0.0 {
            return self.cycle_interval.max(1.0);
        }
        elapsed.max(1.0)
    }

    /// Session-wide real average upload speed, bytes/second.
    #[must_use]
    pub fn real_avg_speed(&self, total_uploaded: u64, now: f64) -> f64 {
        if self.session_start <= 0.0 {
            return 0.0;
        }
        let dt = (now - self.session_start).max(1e-6);
        total_uploaded.saturating_sub(self.session_uploaded_at_start) as f64 / dt
    }

    /// Open a new cycle at `now`.
    ///
    /// With `is_jump` the countdown was observed to jump: the uploaded
    /// baseline is exact. Without it this is the synthetic first cycle and
    /// the baseline is backed out from the Kalman speed, clamped at zero.
    pub fn open_cycle(&mut self, now: f64, uploaded: u64, time_left: f64, is_jump: bool) {
        if is_jump {
            self.jump_count += 1;
            if self.last_jump_time > 0.0 {
                let interval = now - self.last_jump_time;
                if interval > 60.0 {
                    self.cycle_interval = interval;
                    if self.jump_count >= 2 {
                        self.cycle_synced = true;
                    }
                }
            }
            self.last_jump_time = now;
            self.cycle_uploaded_at_start = uploaded;
            self.cycle_synthetic = false;
        } else {
            let interval = self.announce_interval(now);
            let elapsed_in_cycle = if time_left > 0.0 && time_left < interval {
                interval - time_left
            } else {
                0.0
            };
            if self.added_at > 0.0 && now - self.added_at < interval {
                self.cycle_uploaded_at_start = 0;
            } else if elapsed_in_cycle > 60.0 {
                let speed = self.controller.kalman_speed().max(0.0);
                if speed > 0.0 {
                    let estimated = uploaded as f64 - speed * elapsed_in_cycle;
                    self.cycle_uploaded_at_start = estimated.max(0.0) as u64;
                } else {
                    self.cycle_uploaded_at_start = uploaded;
                }
            } else {
                self.cycle_uploaded_at_start = uploaded;
            }
            self.cycle_synthetic = true;
        }

        self.cycle_start = now;
        self.cycle_index += 1;

        self.dl_limited_this_cycle = false;
        self.reannounced_this_cycle = false;
        self.last_dl_cap_kib = -1;

        self.controller.reset();
        self.ring.clear();
        self.prev_time_left = time_left;
    }

    /// Scalar subset for persistence.
    #[must_use]
    pub fn to_persisted(&self) -> PersistedTorrent {
        PersistedTorrent {
            name: self.name.clone(),
            tracker: self.tracker.clone(),
            client_id: self.client_id,
            total_size: self.total_size,
            added_at: self.added_at,
            session_start: self.session_start,
            session_uploaded_at_start: self.session_uploaded_at_start,
            cycle_index: self.cycle_index,
            cycle_start: self.cycle_start,
            cycle_uploaded_at_start: self.cycle_uploaded_at_start,
            cycle_interval: self.cycle_interval,
            cycle_synced: self.cycle_synced,
            cycle_synthetic: self.cycle_synthetic,
            prev_time_left: self.prev_time_left,
            jump_count: self.jump_count,
            last_jump_time: self.last_jump_time,
            cached_time_left: self.cached_time_left,
            time_left_source: self.time_left_source.as_str().to_string(),
            site_id: self.site_id,
            tid: self.tid,
            promotion: self.promotion.clone(),
            publish_time: self.publish_time,
            target_bps: self.target_bps,
            last_up_cap: self.last_up_cap,
            last_dl_cap_kib: self.last_dl_cap_kib,
            last_limit_reason: self.last_limit_reason.clone(),
            dl_limited_this_cycle: self.dl_limited_this_cycle,
            reannounced_this_cycle: self.reannounced_this_cycle,
            waiting_reannounce: self.waiting_reannounce,
            last_reannounce: self.last_reannounce,
        }
    }

    /// Rebuild live state from a persisted record.
    ///
    /// Estimators start cold and warm back up from live measurements; the
    /// countdown cache is re-anchored at load time.
    #[must_use]
    pub fn restore(
        hash: impl Into<String>,
        persisted: &PersistedTorrent,
        tuning: &ControlTuning,
        now: f64,
    ) -> Self {
        let mut state = Self::new(hash, tuning);
        state.name.clone_from(&persisted.name);
        state.tracker.clone_from(&persisted.tracker);
        state.client_id = persisted.client_id;
        state.total_size = persisted.total_size;
        state.added_at = persisted.added_at;
        state.session_start = persisted.session_start;
        state.session_uploaded_at_start = persisted.session_uploaded_at_start;
        state.cycle_index = persisted.cycle_index;
        state.cycle_start = persisted.cycle_start;
        state.cycle_uploaded_at_start = persisted.cycle_uploaded_at_start;
        state.cycle_interval = persisted.cycle_interval;
        state.cycle_synced = persisted.cycle_synced;
        state.cycle_synthetic = persisted.cycle_synthetic;
        state.prev_time_left = persisted.prev_time_left;
        state.jump_count = persisted.jump_count;
        state.last_jump_time = persisted.last_jump_time;
        state.cached_time_left = persisted.cached_time_left;
        state.cache_timestamp = now;
        state.time_left_source = TimeLeftSource::parse(&persisted.time_left_source);
        state.site_id = persisted.site_id;
        state.tid = persisted.tid;
        state.promotion.clone_from(&persisted.promotion);
        state.publish_time = persisted.publish_time;
        state.target_bps = persisted.target_bps;
        state.last_up_cap = persisted.last_up_cap;
        state.last_dl_cap_kib = persisted.last_dl_cap_kib;
        state.last_limit_reason.clone_from(&persisted.last_limit_reason);
        state.dl_limited_this_cycle = persisted.dl_limited_this_cycle;
        state.reannounced_this_cycle = persisted.reannounced_this_cycle;
        state.waiting_reannounce = persisted.waiting_reannounce;
        state.last_reannounce = persisted.last_reannounce;
        state.last_seen = now;
        state
    }
}
