use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{Phase, clamp};

const HISTORY_WINDOW: usize = 30;
const MIN_HISTORY: usize = 5;
const MIN_PHASE_SAMPLES: usize = 3;
const PHASE_ADJ_MIN: f64 = 0.92;
const PHASE_ADJ_MAX: f64 = 1.08;
const GLOBAL_ADJ_MIN: f64 = 0.95;
const GLOBAL_ADJ_MAX: f64 = 1.05;

/// Process-wide learned bias over realised cycle ratios.
///
/// Consumes `actual_avg / target` ratios labelled with the phase active at
/// cycle end and maintains small multiplicative corrections, per phase and
/// global, that the engine folds into the effective target before computing
/// the required rate. This continuously cancels systematic overshoot or
/// undershoot across all torrents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionBias {
    history: VecDeque<(f64, Phase)>,
    warmup_adj: f64,
    catch_adj: f64,
    steady_adj: f64,
    finish_adj: f64,
    global_adj: f64,
}

impl Default for PrecisionBias {
    fn default() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_WINDOW),
            warmup_adj: 1.0,
            catch_adj: 1.0,
            steady_adj: 1.0,
            finish_adj: 1.0,
            global_adj: 1.0,
        }
    }
}

impl PrecisionBias {
    /// Fresh tracker with unity adjustments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed cycle's realised/target ratio.
    pub fn record(&mut self, ratio: f64, phase: Phase) {
        if self.history.len() == HISTORY_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back((ratio, phase));
        self.refresh();
    }

    /// Combined `phase_adj * global_adj` multiplier for the effective target.
    #[must_use]
    pub fn adjustment(&self, phase: Phase) -> f64 {
        self.phase_adj(phase) * self.global_adj
    }

    /// Per-phase component of the adjustment.
    #[must_use]
    pub const fn phase_adj(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Warmup => self.warmup_adj,
            Phase::Catch => self.catch_adj,
            Phase::Steady => self.steady_adj,
            Phase::Finish => self.finish_adj,
        }
    }

    /// Global component of the adjustment.
    #[must_use]
    pub const fn global_adj(&self) -> f64 {
        self.global_adj
    }

    fn phase_adj_mut(&mut self, phase: Phase) -> &mut f64 {
        match phase {
            Phase::Warmup => &mut self.warmup_adj,
            Phase::Catch => &mut self.catch_adj,
            Phase::Steady => &mut self.steady_adj,
            Phase::Finish => &mut self.finish_adj,
        }
    }

    fn refresh(&mut self) {
        if self.history.len() < MIN_HISTORY {
            return;
        }
        for phase in Phase::ALL {
            let ratios: Vec<f64> = self
                .history
                .iter()
                .filter(|(_, p)| *p == phase)
                .map(|&(r, _)| r)
                .collect();
            if ratios.len() < MIN_PHASE_SAMPLES {
                continue;
            }
            let avg = ratios.iter().sum::<f64>() / ratios.len() as f64;
            let factor = if avg > 1.005 {
                0.998
            } else if avg > 1.001 {
                0.999
            } else if avg < 0.99 {
                1.002
            } else if avg < 0.995 {
                1.001
            } else {
                1.0
            };
            let adj = self.phase_adj_mut(phase);
            *adj = clamp(*adj * factor, PHASE_ADJ_MIN, PHASE_ADJ_MAX);
        }

        let global_avg =
            self.history.iter().map(|&(r, _)| r).sum::<f64>() / self.history.len() as f64;
        if global_avg > 1.002 {
            self.global_adj = clamp(self.global_adj * 0.999, GLOBAL_ADJ_MIN, GLOBAL_ADJ_MAX);
        } else if global_avg < 0.995 {
            self.global_adj = clamp(self.global_adj * 1.001, GLOBAL_ADJ_MIN, GLOBAL_ADJ_MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_is_neutral() {
        let bias = PrecisionBias::new();
        for phase in Phase::ALL {
            assert_eq!(bias.adjustment(phase), 1.0);
        }
    }

    #[test]
    fn few_samples_leave_adjustments_untouched() {
        let mut bias = PrecisionBias::new();
        for _ in 0..4 {
            bias.record(1.2, Phase::Steady);
        }
        assert_eq!(bias.adjustment(Phase::Steady), 1.0);
    }

    #[test]
    fn persistent_overshoot_shrinks_adjustment() {
        let mut bias = PrecisionBias::new();
        for _ in 0..20 {
            bias.record(1.02, Phase::Finish);
        }
        assert!(bias.phase_adj(Phase::Finish) < 1.0);
        assert!(bias.global_adj() < 1.0);
        assert!(bias.adjustment(Phase::Finish) < 1.0);
    }

    #[test]
    fn persistent_undershoot_grows_adjustment() {
        let mut bias = PrecisionBias::new();
        for _ in 0..20 {
            bias.record(0.97, Phase::Steady);
        }
        assert!(bias.phase_adj(Phase::Steady) > 1.0);
        assert!(bias.global_adj() > 1.0);
    }

    #[test]
    fn adjustments_stay_clamped() {
        let mut bias = PrecisionBias::new();
        for _ in 0..2_000 {
            bias.record(1.5, Phase::Steady);
        }
        assert!(bias.phase_adj(Phase::Steady) >= PHASE_ADJ_MIN);
        assert!(bias.global_adj() >= GLOBAL_ADJ_MIN);

        let mut bias = PrecisionBias::new();
        for _ in 0..2_000 {
            bias.record(0.5, Phase::Steady);
        }
        assert!(bias.phase_adj(Phase::Steady) <= PHASE_ADJ_MAX);
        assert!(bias.global_adj() <= GLOBAL_ADJ_MAX);
    }

    #[test]
    fn other_phases_are_not_disturbed() {
        let mut bias = PrecisionBias::new();
        for _ in 0..10 {
            bias.record(1.05, Phase::Finish);
        }
        assert_eq!(bias.phase_adj(Phase::Steady), 1.0);
        assert!(bias.phase_adj(Phase::Finish) < 1.0);
    }

    #[test]
    fn state_round_trips_through_serde() {
        let mut bias = PrecisionBias::new();
        for _ in 0..8 {
            bias.record(1.03, Phase::Steady);
        }
        let json = serde_json::to_string(&bias).expect("encode");
        let restored: PrecisionBias = serde_json::from_str(&json).expect("decode");
        assert_eq!(
            restored.adjustment(Phase::Steady),
            bias.adjustment(Phase::Steady)
        );
    }
}
