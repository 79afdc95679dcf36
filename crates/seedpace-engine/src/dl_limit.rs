//! Download cap calculator protecting the hard session ceiling.
//!
//! While a torrent is still downloading, finishing the download ends the
//! cycle's natural upload window; if the in-cycle average is already above
//! the ceiling, the tracker would record an overspeed announce. Stretching
//! the tail of the download buys the time the average needs to fall back
//! under the ceiling.

use seedpace_config::EngineSettings;

use crate::state::TorrentState;

/// Outcome of one download-cap evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlDecision {
    /// Leave whatever cap is active in place.
    NoChange,
    /// Lift the active cap.
    Release(&'static str),
    /// Apply (or tighten to) a cap.
    Apply {
        /// Cap in KiB/s.
        cap_kib: i64,
        /// Reason tag.
        reason: &'static str,
    },
}

/// Evaluate the download cap for one torrent at `now`.
///
/// `ceiling_bps` is the hard per-session bound, not the user target. An
/// active cap is kept while the average stays above the ceiling; it is only
/// replaced by a meaningfully tighter one, and released once the average
/// recovers.
#[must_use]
pub fn calc_dl_cap(
    state: &TorrentState,
    total_done: u64,
    total_uploaded: u64,
    total_size: u64,
    dl_speed: f64,
    now: f64,
    settings: &EngineSettings,
    ceiling_bps: i64,
) -> DlDecision {
    let cycle_up = state.cycle_uploaded(total_uploaded) as f64;
    let cycle_elapsed = state.cycle_elapsed(now);
    if cycle_elapsed < 2.0 {
        return DlDecision::NoChange;
    }

    let ceiling = ceiling_bps as f64;
    let avg_speed = cycle_up / cycle_elapsed;
    if avg_speed <= ceiling {
        if state.last_dl_cap_kib > 0 {
            return DlDecision::Release("average-recovered");
        }
        return DlDecision::NoChange;
    }

    let remaining = total_size.saturating_sub(total_done) as f64;
    if remaining <= 0.0 {
        return DlDecision::NoChange;
    }

    let eta = remaining / dl_speed.max(1.0);
    let min_time = settings.dl_limit_min_time * if state.last_up_cap > 0 { 2.0 } else { 1.0 };

    if state.last_dl_cap_kib <= 0 {
        if eta > 0.0 && eta <= min_time {
            let drain = cycle_up / ceiling - cycle_elapsed + settings.dl_limit_buffer;
            if drain <= 0.0 {
                return DlDecision::Apply {
                    cap_kib: settings.dl_limit_min_kib,
                    reason: "overspeed-severe",
                };
            }
            let cap = ((remaining / drain / 1_024.0) as i64).max(settings.dl_limit_min_kib);
            return DlDecision::Apply {
                cap_kib: cap,
                reason: "avg-over-limit",
            };
        }
    } else if dl_speed / 1_024.0 < (2 * state.last_dl_cap_kib) as f64 {
        let drain = cycle_up / ceiling - cycle_elapsed + settings.dl_limit_adjust_buffer;
        if drain <= 0.0 {
            return DlDecision::Apply {
                cap_kib: settings.dl_limit_min_kib,
                reason: "overspeed-persistent",
            };
        }
        let cap = ((remaining / drain / 1_024.0) as i64).max(settings.dl_limit_min_kib);
        if (cap as f64) < state.last_dl_cap_kib as f64 * 0.95 {
            return DlDecision::Apply {
                cap_kib: cap,
                reason: "tighten",
            };
        }
    }

    DlDecision::NoChange
}
