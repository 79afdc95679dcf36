use serde::{Deserialize, Serialize};

use crate::Phase;

/// PID gains plus the rate headroom applied for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseGains {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
    /// Multiplier biasing the required rate toward slight overshoot.
    pub headroom: f64,
}

/// Tunables for the control stack.
///
/// Defaults carry the values the controller converges well with in practice;
/// deployments override them through the engine settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlTuning {
    /// Gains for the warmup phase.
    pub warmup: PhaseGains,
    /// Gains for the catch phase.
    pub catch: PhaseGains,
    /// Gains for the steady phase.
    pub steady: PhaseGains,
    /// Gains for the finish phase.
    pub finish: PhaseGains,
    /// Smallest cap ever issued, bytes/second.
    pub min_limit: i64,
    /// Quantiser base step per phase, bytes/second.
    pub quant_steps: QuantSteps,
    /// Kalman process noise on the speed component.
    pub kalman_q_speed: f64,
    /// Kalman process noise on the acceleration component.
    pub kalman_q_accel: f64,
    /// Kalman measurement noise.
    pub kalman_r: f64,
}

/// Quantiser base step per phase, bytes/second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantSteps {
    /// Base step while unsynchronised.
    pub warmup: i64,
    /// Base step while catching up.
    pub catch: i64,
    /// Base step in steady state.
    pub steady: i64,
    /// Base step in the end-game.
    pub finish: i64,
}

impl Default for QuantSteps {
    fn default() -> Self {
        Self {
            warmup: 4_096,
            catch: 2_048,
            steady: 512,
            finish: 256,
        }
    }
}

impl QuantSteps {
    /// Base step for `phase`.
    #[must_use]
    pub const fn for_phase(&self, phase: Phase) -> i64 {
        match phase {
            Phase::Warmup => self.warmup,
            Phase::Catch => self.catch,
            Phase::Steady => self.steady,
            Phase::Finish => self.finish,
        }
    }
}

impl Default for ControlTuning {
    fn default() -> Self {
        Self {
            warmup: PhaseGains {
                kp: 0.3,
                ki: 0.05,
                kd: 0.02,
                headroom: 1.030,
            },
            catch: PhaseGains {
                kp: 0.5,
                ki: 0.10,
                kd: 0.05,
                headroom: 1.020,
            },
            steady: PhaseGains {
                kp: 0.6,
                ki: 0.15,
                kd: 0.08,
                headroom: 1.005,
            },
            finish: PhaseGains {
                kp: 0.8,
                ki: 0.20,
                kd: 0.12,
                headroom: 1.001,
            },
            min_limit: 4_096,
            quant_steps: QuantSteps::default(),
            kalman_q_speed: 0.1,
            kalman_q_accel: 0.05,
            kalman_r: 0.5,
        }
    }
}

impl ControlTuning {
    /// Gains for `phase`.
    #[must_use]
    pub const fn gains(&self, phase: Phase) -> PhaseGains {
        match phase {
            Phase::Warmup => self.warmup,
            Phase::Catch => self.catch,
            Phase::Steady => self.steady,
            Phase::Finish => self.finish,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gains_tighten_towards_finish() {
        let tuning = ControlTuning::default();
        assert!(tuning.finish.kp > tuning.steady.kp);
        assert!(tuning.steady.kp > tuning.catch.kp);
        assert!(tuning.catch.kp > tuning.warmup.kp);
        assert!(tuning.finish.headroom < tuning.warmup.headroom);
        assert_eq!(tuning.min_limit, 4_096);
    }

    #[test]
    fn quant_steps_shrink_towards_finish() {
        let steps = QuantSteps::default();
        assert_eq!(steps.for_phase(Phase::Warmup), 4_096);
        assert_eq!(steps.for_phase(Phase::Catch), 2_048);
        assert_eq!(steps.for_phase(Phase::Steady), 512);
        assert_eq!(steps.for_phase(Phase::Finish), 256);
    }
}
