use crate::tuning::ControlTuning;
use crate::{Phase, safe_div};

const STEP_MIN: i64 = 256;
const STEP_MAX: i64 = 8_192;

/// Round a positive rate command to the active quantiser step.
///
/// The step starts at the phase base, widens when the current speed runs hot
/// against the target, narrows when it runs cold, and halves again while the
/// speed is visibly moving. Non-positive commands (uncapped / sentinel) pass
/// through untouched.
#[must_use]
pub fn quantize(
    limit: i64,
    phase: Phase,
    current_speed: f64,
    target: f64,
    tuning: &ControlTuning,
    trend: f64,
) -> i64 {
    if limit <= 0 {
        return limit;
    }
    let base = tuning.quant_steps.for_phase(phase);
    let ratio = safe_div(current_speed, target, 1.0);
    let mut step = if phase == Phase::Finish {
        tuning.quant_steps.finish
    } else if ratio > 1.2 {
        base * 2
    } else if ratio > 1.05 {
        base
    } else if ratio > 0.8 {
        base / 2
    } else {
        base
    };
    if trend.abs() > 0.1 {
        step = (step / 2).max(STEP_MIN);
    }
    step = step.clamp(STEP_MIN, STEP_MAX);
    ((limit + step / 2) / step * step).max(tuning.min_limit)
}

/// Exponential smoother over successive quantised commands.
///
/// Small relative changes pass straight through; larger ones are eased with a
/// factor that grows with the size of the jump. The finish phase bypasses
/// smoothing entirely so the end-game reacts within one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Smoother {
    last: i64,
}

impl Smoother {
    /// Smoother with no history; the first command passes through.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: -1 }
    }

    /// Blend `new_limit` against the previous accepted command.
    pub fn apply(&mut self, new_limit: i64, phase: Phase) -> i64 {
        if new_limit <= 0 || self.last <= 0 || phase == Phase::Finish {
            self.last = new_limit;
            return new_limit;
        }
        let change = (new_limit - self.last).abs() as f64 / self.last as f64;
        if change < 0.2 {
            self.last = new_limit;
        } else {
            let factor = if change >= 0.5 { 0.5 } else { 0.3 };
            self.last = ((1.0 - factor) * self.last as f64 + factor * new_limit as f64) as i64;
        }
        self.last
    }

    /// Forget the previous command at a cycle boundary.
    pub fn reset(&mut self) {
        self.last = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> ControlTuning {
        ControlTuning::default()
    }

    #[test]
    fn result_is_step_multiple_and_floored() {
        let t = tuning();
        for (limit, phase) in [
            (5_000_i64, Phase::Warmup),
            (123_456, Phase::Steady),
            (999_999, Phase::Catch),
            (70_001, Phase::Finish),
        ] {
            let q = quantize(limit, phase, 0.0, 1_000_000.0, &t, 0.0);
            assert!(q >= t.min_limit, "{q} under min limit");
            // Reconstruct the effective step from the phase/ratio rules.
            let base = t.quant_steps.for_phase(phase);
            let step = if phase == Phase::Finish {
                256
            } else {
                // ratio 0 -> cold branch -> base step
                base
            };
            assert_eq!(q % step, 0, "{q} not aligned to {step}");
        }
    }

    #[test]
    fn hot_ratio_doubles_step_cold_ratio_halves() {
        let t = tuning();
        // steady base 512; ratio > 1.2 -> 1024; 0.8 < ratio <= 1.05 -> 256.
        let hot = quantize(10_000, Phase::Steady, 130.0, 100.0, &t, 0.0);
        assert_eq!(hot % 1_024, 0);
        let cold = quantize(10_000, Phase::Steady, 90.0, 100.0, &t, 0.0);
        assert_eq!(cold % 256, 0);
    }

    #[test]
    fn moving_trend_tightens_step() {
        let t = tuning();
        // warmup base 4096, trend halves to 2048.
        let q = quantize(10_000, Phase::Warmup, 50.0, 100.0, &t, 0.2);
        assert_eq!(q % 2_048, 0);
    }

    #[test]
    fn rounds_to_nearest_not_down() {
        let t = tuning();
        // finish step 256: 4200 is nearer 4096, 4300 is nearer 4352.
        assert_eq!(quantize(4_200, Phase::Finish, 0.0, 1.0, &t, 0.0), 4_096);
        assert_eq!(quantize(4_300, Phase::Finish, 0.0, 1.0, &t, 0.0), 4_352);
    }

    #[test]
    fn small_commands_clamp_to_min_limit() {
        let t = tuning();
        assert_eq!(quantize(100, Phase::Finish, 0.0, 1.0, &t, 0.0), t.min_limit);
    }

    #[test]
    fn negative_commands_pass_through() {
        let t = tuning();
        assert_eq!(quantize(-1, Phase::Steady, 0.0, 1.0, &t, 0.0), -1);
    }

    #[test]
    fn smoother_accepts_small_changes() {
        let mut smoother = Smoother::new();
        assert_eq!(smoother.apply(10_000, Phase::Steady), 10_000);
        assert_eq!(smoother.apply(11_000, Phase::Steady), 11_000);
    }

    #[test]
    fn smoother_eases_large_jumps() {
        let mut smoother = Smoother::new();
        smoother.apply(10_000, Phase::Steady);
        // 100% change -> factor 0.5 -> midpoint.
        assert_eq!(smoother.apply(20_000, Phase::Steady), 15_000);
        // 30% change from 15_000 -> factor 0.3.
        let next = smoother.apply(19_500, Phase::Steady);
        assert_eq!(next, 16_350);
    }

    #[test]
    fn smoother_bypassed_in_finish() {
        let mut smoother = Smoother::new();
        smoother.apply(10_000, Phase::Steady);
        assert_eq!(smoother.apply(40_000, Phase::Finish), 40_000);
    }
}
