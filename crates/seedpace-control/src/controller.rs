use crate::kalman::SpeedKalman;
use crate::pid::PidController;
use crate::quantize::{Smoother, quantize};
use crate::tuning::ControlTuning;
use crate::windows::MultiWindowTracker;
use crate::{Phase, safe_div};

/// Inputs for one cap computation.
#[derive(Debug, Clone, Copy)]
pub struct CalcInput {
    /// Effective target, bytes/second (rule target after safety margin).
    pub target_bps: f64,
    /// Bytes uploaded since the cycle opened.
    pub uploaded: u64,
    /// Seconds until the next tracker announce.
    pub time_left: f64,
    /// Seconds since the cycle opened.
    pub elapsed: f64,
    /// Active phase.
    pub phase: Phase,
    /// Current time, seconds.
    pub now: f64,
    /// Precision-bias multiplier folded into the target.
    pub bias_adj: f64,
}

/// Intermediate values of a cap computation, kept for inspection surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalcDebug {
    /// Predicted end-of-cycle ratio from the Kalman extrapolation.
    pub predicted_ratio: f64,
    /// Rate needed to land the remaining bytes in the remaining time.
    pub required_bps: f64,
    /// PID correction factor.
    pub pid_output: f64,
    /// Phase-weighted current speed used by the quantiser.
    pub current_bps: f64,
    /// Recent speed trend fed to the quantiser.
    pub trend: f64,
    /// Cap after quantisation and smoothing.
    pub final_cap: i64,
}

/// Result of a cap computation.
#[derive(Debug, Clone, PartialEq)]
pub struct CapDecision {
    /// Upload cap in bytes/second; `-1` means uncapped.
    pub cap: i64,
    /// Short reason tag for logs and the inspection surface.
    pub reason: String,
    /// Intermediate values.
    pub debug: CalcDebug,
}

/// Per-torrent rate controller: Kalman + multi-window estimator + PID +
/// quantiser + smoother, composed into the phase-branch cap computation.
///
/// The engine owns one per torrent, feeds it one speed sample per tick via
/// [`Self::record`], and asks for a cap via [`Self::calculate`]. All state is
/// value-typed and reset in place at cycle boundaries.
#[derive(Debug, Clone)]
pub struct RateController {
    tuning: ControlTuning,
    kalman: SpeedKalman,
    windows: MultiWindowTracker,
    pid: PidController,
    smoother: Smoother,
}

const TREND_WINDOW: f64 = 10.0;

impl RateController {
    /// Controller using the supplied tuning.
    #[must_use]
    pub fn new(tuning: &ControlTuning) -> Self {
        Self {
            tuning: tuning.clone(),
            kalman: SpeedKalman::new(
                tuning.kalman_q_speed,
                tuning.kalman_q_accel,
                tuning.kalman_r,
            ),
            windows: MultiWindowTracker::new(),
            pid: PidController::new(),
            smoother: Smoother::new(),
        }
    }

    /// Feed the instantaneous upload speed observed at `now`.
    pub fn record(&mut self, now: f64, speed: f64) {
        self.kalman.update(speed, now);
        self.windows.record(now, speed);
    }

    /// Kalman-filtered speed estimate, bytes/second.
    #[must_use]
    pub const fn kalman_speed(&self) -> f64 {
        self.kalman.speed
    }

    /// Bytes the Kalman model expects over the next `time_left` seconds.
    #[must_use]
    pub fn predict_upload(&self, time_left: f64) -> f64 {
        self.kalman.predict_upload(time_left)
    }

    /// Compute the upload cap for the current tick.
    #[must_use]
    pub fn calculate(&mut self, input: CalcInput) -> CapDecision {
        let CalcInput {
            target_bps,
            uploaded,
            time_left,
            elapsed,
            phase,
            now,
            bias_adj,
        } = input;

        let adjusted_target = target_bps * bias_adj;
        let weighted = self.windows.weighted_avg(now, phase);
        let trend = self.windows.recent_trend(now, TREND_WINDOW);
        let kalman_speed = self.kalman.speed;
        let current_bps = if phase == Phase::Finish && weighted > 0.0 {
            weighted
        } else if kalman_speed > 0.0 {
            kalman_speed
        } else {
            weighted
        };

        let uploaded_f = uploaded as f64;
        let total_time = elapsed + time_left;
        let target_total = adjusted_target * total_time;
        let predicted_ratio = safe_div(
            uploaded_f + self.kalman.predict_upload(time_left),
            target_total,
            0.0,
        );

        let mut debug = CalcDebug {
            predicted_ratio,
            current_bps,
            trend,
            ..CalcDebug::default()
        };

        if time_left <= 0.0 {
            debug.final_cap = -1;
            return CapDecision {
                cap: -1,
                reason: "announcing".to_string(),
                debug,
            };
        }

        let required = (target_total - uploaded_f).max(0.0) / time_left;
        debug.required_bps = required;

        let gains = self.tuning.gains(phase);
        self.pid.set_gains(gains);
        let pid_output = self.pid.update(target_total, uploaded_f, now);
        debug.pid_output = pid_output;
        let mut headroom = gains.headroom;

        let (mut cap, reason): (i64, String) = match phase {
            Phase::Finish => {
                let correction = if predicted_ratio > 1.002 {
                    (1.0 - (predicted_ratio - 1.0) * 3.0).max(0.8)
                } else if predicted_ratio < 0.998 {
                    (1.0 + (1.0 - predicted_ratio) * 3.0).min(1.2)
                } else {
                    1.0
                };
                (
                    (required * pid_output * correction) as i64,
                    format!("finish:{:.0}K", required / 1_024.0),
                )
            }
            Phase::Steady => {
                if predicted_ratio > 1.01 {
                    headroom = 1.0;
                }
                (
                    (required * headroom * pid_output) as i64,
                    format!("steady:{:.0}K", required / 1_024.0),
                )
            }
            Phase::Catch => {
                if required > adjusted_target * 5.0 {
                    (-1, "catch-release".to_string())
                } else {
                    (
                        (required * headroom * pid_output) as i64,
                        format!("catch:{:.0}K", required / 1_024.0),
                    )
                }
            }
            Phase::Warmup => {
                let progress = safe_div(uploaded_f, target_total, 0.0);
                if progress >= 1.0 {
                    (
                        self.tuning.min_limit,
                        format!("warmup-over:{:.0}%", (progress - 1.0) * 100.0),
                    )
                } else if progress >= 0.8 {
                    (
                        (required * 1.01 * pid_output) as i64,
                        "warmup-fine".to_string(),
                    )
                } else if progress >= 0.5 {
                    ((required * 1.05) as i64, "warmup-warm".to_string())
                } else {
                    (-1, "warmup".to_string())
                }
            }
        };

        if cap > 0 {
            cap = quantize(cap, phase, current_bps, adjusted_target, &self.tuning, trend);
        }
        cap = self.smoother.apply(cap, phase);
        debug.final_cap = cap;

        CapDecision { cap, reason, debug }
    }

    /// Reset all sub-estimators at a cycle boundary.
    pub fn reset(&mut self) {
        self.kalman.reset();
        self.windows.clear();
        self.pid.reset();
        self.smoother.reset();
    }
}
