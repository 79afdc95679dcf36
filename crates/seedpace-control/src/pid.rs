use crate::tuning::PhaseGains;
use crate::{clamp, safe_div};

/// Phase-gain PID producing a multiplicative correction factor.
///
/// Error is the relative shortfall of cumulative uploaded bytes against the
/// cumulative target, so the output is unitless: `1.0` means the cycle is on
/// track, values in `[0.5, 2.0]` scale the required rate up or down.
#[derive(Debug, Clone, PartialEq)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    last_error: f64,
    last_time: f64,
    last_output: f64,
    derivative_filter: f64,
    initialized: bool,
}

const INTEGRAL_LIMIT: f64 = 0.3;
const OUTPUT_MIN: f64 = 0.5;
const OUTPUT_MAX: f64 = 2.0;

impl PidController {
    /// Controller with steady-state gains until [`Self::set_gains`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kp: 0.6,
            ki: 0.15,
            kd: 0.08,
            integral: 0.0,
            last_error: 0.0,
            last_time: 0.0,
            last_output: 1.0,
            derivative_filter: 0.0,
            initialized: false,
        }
    }

    /// Switch to the gains of the active phase.
    pub fn set_gains(&mut self, gains: PhaseGains) {
        self.kp = gains.kp;
        self.ki = gains.ki;
        self.kd = gains.kd;
    }

    /// Update with the cumulative target and achieved bytes at `now`.
    ///
    /// The first update only initialises and returns exactly `1.0`; updates
    /// closer than 10 ms apart return the previous output unchanged.
    pub fn update(&mut self, target: f64, actual: f64, now: f64) -> f64 {
        let error = safe_div(target - actual, target.max(1.0), 0.0);
        if !self.initialized {
            self.last_error = error;
            self.last_time = now;
            self.initialized = true;
            return 1.0;
        }
        let dt = now - self.last_time;
        if dt <= 0.01 {
            return self.last_output;
        }
        self.last_time = now;

        let p_term = self.kp * error;
        self.integral = clamp(self.integral + error * dt, -INTEGRAL_LIMIT, INTEGRAL_LIMIT);
        let i_term = self.ki * self.integral;

        let raw_derivative = (error - self.last_error) / dt;
        self.derivative_filter = 0.3 * raw_derivative + 0.7 * self.derivative_filter;
        let d_term = self.kd * self.derivative_filter;
        self.last_error = error;

        let output = clamp(1.0 + p_term + i_term + d_term, OUTPUT_MIN, OUTPUT_MAX);
        self.last_output = output;
        output
    }

    /// Forget accumulated state at a cycle boundary.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_time = 0.0;
        self.last_output = 1.0;
        self.derivative_filter = 0.0;
        self.initialized = false;
    }
}

impl Default for PidController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_update_returns_unity() {
        let mut pid = PidController::new();
        assert_eq!(pid.update(1_000.0, 0.0, 10.0), 1.0);
    }

    #[test]
    fn output_stays_inside_bounds_under_extremes() {
        let mut pid = PidController::new();
        pid.update(1_000.0, 0.0, 0.0);
        for i in 1..200 {
            let now = f64::from(i);
            // Alternate wild overshoot and undershoot.
            let actual = if i % 2 == 0 { 0.0 } else { 1_000_000.0 };
            let output = pid.update(1_000.0, actual, now);
            assert!((OUTPUT_MIN..=OUTPUT_MAX).contains(&output), "out: {output}");
        }
    }

    #[test]
    fn behind_target_pushes_above_unity() {
        let mut pid = PidController::new();
        pid.update(10_000.0, 0.0, 0.0);
        let mut output = 1.0;
        for i in 1..10 {
            output = pid.update(10_000.0, 2_000.0, f64::from(i));
        }
        assert!(output > 1.0, "persistent shortfall should raise output");
    }

    #[test]
    fn ahead_of_target_pulls_below_unity() {
        let mut pid = PidController::new();
        pid.update(10_000.0, 0.0, 0.0);
        let mut output = 1.0;
        for i in 1..10 {
            output = pid.update(10_000.0, 18_000.0, f64::from(i));
        }
        assert!(output < 1.0, "overshoot should lower output");
    }

    #[test]
    fn rapid_updates_reuse_last_output() {
        let mut pid = PidController::new();
        pid.update(1_000.0, 0.0, 0.0);
        let first = pid.update(1_000.0, 100.0, 1.0);
        let repeat = pid.update(1_000.0, 999.0, 1.005);
        assert_eq!(first, repeat);
    }

    #[test]
    fn reset_restores_initial_behaviour() {
        let mut pid = PidController::new();
        pid.update(1_000.0, 0.0, 0.0);
        pid.update(1_000.0, 100.0, 5.0);
        pid.reset();
        assert_eq!(pid.update(1_000.0, 900.0, 50.0), 1.0);
    }
}
