#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Control primitives for the seedpace limit engine.
//!
//! Everything in this crate is value-typed and free of I/O: the Kalman speed
//! estimator, the multi-window average tracker, the phase-gain PID, the
//! adaptive quantiser, the process-global precision bias tracker, and the
//! composed per-torrent rate controller. The limit engine owns one
//! [`RateController`] per torrent and drives it with wall-clock seconds; the
//! tests drive it with synthetic time.

mod bias;
mod controller;
mod kalman;
mod pid;
mod quantize;
mod tuning;
mod windows;

pub use bias::PrecisionBias;
pub use controller::{CalcDebug, CalcInput, CapDecision, RateController};
pub use kalman::SpeedKalman;
pub use pid::PidController;
pub use quantize::{Smoother, quantize};
pub use tuning::{ControlTuning, PhaseGains};
pub use windows::{MultiWindowTracker, SampleRing, SpeedSample};

use serde::{Deserialize, Serialize};

/// Where inside an announce cycle a torrent currently is.
///
/// Pure function of the cycle-sync flag and the seconds left until the next
/// announce; every phase-dependent table (PID gains, window weights, quantiser
/// steps, properties refresh cadence) keys off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Cycle boundaries not yet synchronised with the tracker.
    Warmup,
    /// Less than 60 s to the announce; closing the gap.
    Catch,
    /// More than 60 s to the announce.
    Steady,
    /// Less than 10 s to the announce; precision end-game.
    Finish,
}

impl Phase {
    /// Classify the phase from the sync flag and seconds to the next announce.
    #[must_use]
    pub fn classify(cycle_synced: bool, time_left: f64) -> Self {
        if !cycle_synced {
            Self::Warmup
        } else if time_left < 10.0 {
            Self::Finish
        } else if time_left < 60.0 {
            Self::Catch
        } else {
            Self::Steady
        }
    }

    /// All phases, for table iteration.
    pub const ALL: [Self; 4] = [Self::Warmup, Self::Catch, Self::Steady, Self::Finish];
}

/// Division that returns `default` instead of dividing by (near) zero.
#[must_use]
pub fn safe_div(a: f64, b: f64, default: f64) -> f64 {
    if b.abs() < 1e-10 { default } else { a / b }
}

/// Clamp `value` into `[min, max]`.
#[must_use]
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}
