//! Forced-reannounce decisions.
//!
//! When a site enforces a hard session ceiling, an announce that lands while
//! the lifetime average is above it is wasted (or worse). The optimiser
//! either forces an early announce at a provably safe instant, or stalls the
//! upload (`waiting_reannounce`) until the running average falls back under
//! the ceiling and then announces.

use seedpace_config::EngineSettings;

use crate::state::TorrentState;
use crate::{REANNOUNCE_MIN_INTERVAL, REANNOUNCE_SPEED_WINDOW};

/// Decision from one optimiser evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReannounceDecision {
    /// Nothing to do this tick.
    None,
    /// Force a reannounce now, with a reason tag.
    Force(&'static str),
    /// Keep uploading stalled; the waiting flag was just set.
    Wait,
}

/// Decide whether to force a reannounce for an over-ceiling torrent.
///
/// Sets `state.waiting_reannounce` when the optimal announce instant is near
/// but not yet reached.
pub fn should_reannounce(
    state: &mut TorrentState,
    total_done: u64,
    total_uploaded: u64,
    total_size: u64,
    now: f64,
    settings: &EngineSettings,
    ceiling_bps: i64,
) -> ReannounceDecision {
    if state.last_reannounce > 0.0 && now - state.last_reannounce < REANNOUNCE_MIN_INTERVAL {
        return ReannounceDecision::None;
    }

    let cycle_up = state.cycle_uploaded(total_uploaded) as f64;
    let cycle_elapsed = state.cycle_elapsed(now);
    if cycle_elapsed < 30.0 {
        return ReannounceDecision::None;
    }

    let ceiling = ceiling_bps as f64;
    let (avg_up, avg_dl) = state.ring.avg_speeds(now, REANNOUNCE_SPEED_WINDOW);
    if avg_up <= ceiling || avg_dl <= 0.0 {
        return ReannounceDecision::None;
    }

    let remaining = total_size.saturating_sub(total_done) as f64;
    if remaining <= 0.0 {
        return ReannounceDecision::None;
    }

    let announce_interval = state.announce_interval(now);
    let complete_time = remaining / avg_dl + now;
    let perfect_time = complete_time - announce_interval * ceiling / avg_up;

    let cycle_avg = cycle_up / cycle_elapsed;
    let earliest = if cycle_avg > ceiling {
        (cycle_up - ceiling * cycle_elapsed) / settings.recovery_slope_bps + now
    } else {
        now
    };

    if earliest - state.cycle_start < REANNOUNCE_MIN_INTERVAL {
        return ReannounceDecision::None;
    }

    if earliest > perfect_time {
        if now >= earliest {
            if cycle_avg > ceiling {
                return ReannounceDecision::Force("optimised");
            }
        } else if earliest < perfect_time + 60.0 {
            state.waiting_reannounce = true;
            return ReannounceDecision::Wait;
        }
    }

    ReannounceDecision::None
}

/// Resolve a pending waiting-reannounce: once the cycle average has dropped
/// back under the ceiling after a full minimum interval, clear the flag and
/// announce.
pub fn check_waiting(
    state: &mut TorrentState,
    total_uploaded: u64,
    now: f64,
    ceiling_bps: i64,
) -> ReannounceDecision {
    if !state.waiting_reannounce {
        return ReannounceDecision::None;
    }

    let cycle_elapsed = state.cycle_elapsed(now);
    if cycle_elapsed < REANNOUNCE_MIN_INTERVAL {
        return ReannounceDecision::None;
    }

    let cycle_up = state.cycle_uploaded(total_uploaded) as f64;
    let avg = if cycle_elapsed > 0.0 {
        cycle_up / cycle_elapsed
    } else {
        0.0
    };
    if avg < ceiling_bps as f64 {
        state.waiting_reannounce = false;
        return ReannounceDecision::Force("average-recovered");
    }

    ReannounceDecision::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedpace_control::ControlTuning;

    const MIB: f64 = 1024.0 * 1024.0;
    const CEILING: i64 = 50 * 1024 * 1024;

    /// 1000 s into a cycle at 1.5x the ceiling, still downloading.
    fn hot_state(now: f64) -> TorrentState {
        let mut st = TorrentState::new("e".repeat(40), &ControlTuning::default());
        st.added_at = now - 3_600.0;
        st.cycle_start = now - 1_000.0;
        st.cycle_uploaded_at_start = 0;
        st.cycle_synced = true;
        st.cycle_interval = 1_800.0;
        // Ring shows sustained 75 MiB/s up, 1 MiB/s down.
        for i in 0..300 {
            st.ring.record(now - 300.0 + f64::from(i), 75.0 * MIB, MIB);
        }
        st
    }

    fn uploaded_for(avg_over_ceiling: f64, seconds: f64) -> u64 {
        (avg_over_ceiling * CEILING as f64 * seconds) as u64
    }

    #[test]
    fn waiting_set_when_optimal_instant_is_near() {
        let now = 10_000.0;
        let mut st = hot_state(now);
        let uploaded = uploaded_for(1.5, 1_000.0);
        // ETA tuned so that earliest lands inside (perfect, perfect + 60).
        let remaining = (1_720.0 * MIB) as u64;
        let total_size = 100_000 * (MIB as u64);
        let decision = should_reannounce(
            &mut st,
            total_size - remaining,
            uploaded,
            total_size,
            now,
            &EngineSettings::default(),
            CEILING,
        );
        assert_eq!(decision, ReannounceDecision::Wait);
        assert!(st.waiting_reannounce);
    }

    #[test]
    fn distant_completion_keeps_quiet() {
        let now = 10_000.0;
        let mut st = hot_state(now);
        let uploaded = uploaded_for(1.5, 1_000.0);
        let remaining = (50_000.0 * MIB) as u64;
        let total_size = 100_000 * (MIB as u64);
        let decision = should_reannounce(
            &mut st,
            total_size - remaining,
            uploaded,
            total_size,
            now,
            &EngineSettings::default(),
            CEILING,
        );
        assert_eq!(decision, ReannounceDecision::None);
        assert!(!st.waiting_reannounce);
    }

    #[test]
    fn recent_forced_reannounce_blocks_another() {
        let now = 10_000.0;
        let mut st = hot_state(now);
        st.last_reannounce = now - 100.0;
        let decision = should_reannounce(
            &mut st,
            0,
            uploaded_for(1.5, 1_000.0),
            u64::MAX / 2,
            now,
            &EngineSettings::default(),
            CEILING,
        );
        assert_eq!(decision, ReannounceDecision::None);
    }

    #[test]
    fn ring_under_ceiling_keeps_quiet() {
        let now = 10_000.0;
        let mut st = hot_state(now);
        st.ring.clear();
        for i in 0..300 {
            st.ring.record(now - 300.0 + f64::from(i), 10.0 * MIB, MIB);
        }
        let decision = should_reannounce(
            &mut st,
            0,
            uploaded_for(1.5, 1_000.0),
            u64::MAX / 2,
            now,
            &EngineSettings::default(),
            CEILING,
        );
        assert_eq!(decision, ReannounceDecision::None);
    }

    #[test]
    fn completed_download_keeps_quiet() {
        let now = 10_000.0;
        let mut st = hot_state(now);
        let total_size = 100_000 * (MIB as u64);
        let decision = should_reannounce(
            &mut st,
            total_size,
            uploaded_for(1.5, 1_000.0),
            total_size,
            now,
            &EngineSettings::default(),
            CEILING,
        );
        assert_eq!(decision, ReannounceDecision::None);
    }

    #[test]
    fn waiting_resolves_after_average_recovers() {
        let now = 10_000.0;
        let mut st = hot_state(now);
        st.waiting_reannounce = true;
        // Upload stalled long enough that the cycle average fell under.
        st.cycle_start = now - 1_600.0;
        let uploaded = uploaded_for(1.5, 1_000.0); // avg = 1500/1600 * 1.5x ≈ 0.94x
        let decision = check_waiting(&mut st, uploaded, now, CEILING);
        assert_eq!(decision, ReannounceDecision::Force("average-recovered"));
        assert!(!st.waiting_reannounce);
    }

    #[test]
    fn waiting_holds_while_average_still_hot() {
        let now = 10_000.0;
        let mut st = hot_state(now);
        st.waiting_reannounce = true;
        let uploaded = uploaded_for(1.5, 1_000.0); // avg 1.5x over 1000 s
        let decision = check_waiting(&mut st, uploaded, now, CEILING);
        assert_eq!(decision, ReannounceDecision::None);
        assert!(st.waiting_reannounce);
    }

    #[test]
    fn waiting_needs_a_full_minimum_interval() {
        let now = 10_000.0;
        let mut st = hot_state(now);
        st.waiting_reannounce = true;
        st.cycle_start = now - 100.0;
        let decision = check_waiting(&mut st, 0, now, CEILING);
        assert_eq!(decision, ReannounceDecision::None);
        assert!(st.waiting_reannounce);
    }
}
