use std::collections::VecDeque;

use crate::{Phase, safe_div};

/// One upload/download speed observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    /// Observation time, seconds.
    pub at: f64,
    /// Upload speed, bytes/second.
    pub up_bps: f64,
    /// Download speed, bytes/second.
    pub dl_bps: f64,
}

/// Bounded ring of raw speed samples.
///
/// Feeds the reannounce optimiser's recent averages and the per-torrent
/// sample query of the control surface. Distinct from [`MultiWindowTracker`],
/// which only sees upload speeds and serves the rate controller.
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: VecDeque<SpeedSample>,
    capacity: usize,
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new()
    }
}

const SAMPLE_RING_CAPACITY: usize = 3_600;

impl SampleRing {
    /// Ring with the default capacity (one observation per second for an hour).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(SAMPLE_RING_CAPACITY)
    }

    /// Ring bounded to `capacity` samples (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(1_024)),
            capacity,
        }
    }

    /// Append an observation, evicting the oldest when full.
    pub fn record(&mut self, at: f64, up_bps: f64, dl_bps: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(SpeedSample { at, up_bps, dl_bps });
    }

    /// Average `(up, dl)` over the trailing `window` seconds, `(0, 0)` when
    /// no sample falls inside it.
    #[must_use]
    pub fn avg_speeds(&self, now: f64, window: f64) -> (f64, f64) {
        let mut count = 0usize;
        let mut up = 0.0;
        let mut dl = 0.0;
        for sample in self.samples.iter().rev() {
            if now - sample.at > window {
                break;
            }
            up += sample.up_bps;
            dl += sample.dl_bps;
            count += 1;
        }
        if count == 0 {
            return (0.0, 0.0);
        }
        let n = count as f64;
        (up / n, dl / n)
    }

    /// Samples inside the trailing `window` seconds, oldest first.
    #[must_use]
    pub fn samples_since(&self, now: f64, window: f64) -> Vec<SpeedSample> {
        self.samples
            .iter()
            .filter(|sample| now - sample.at <= window)
            .copied()
            .collect()
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Number of buffered samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the ring holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Upload-speed tracker with phase-weighted multi-window averages.
///
/// Keeps at least twenty minutes of once-per-tick samples and blends the
/// {5, 15, 30, 60} second window averages with weights chosen per phase:
/// warmup trusts the long windows, finish the short ones.
#[derive(Debug, Clone)]
pub struct MultiWindowTracker {
    samples: VecDeque<(f64, f64)>,
}

const MULTI_WINDOW_CAPACITY: usize = 1_200;
const WINDOWS: [f64; 4] = [5.0, 15.0, 30.0, 60.0];

impl MultiWindowTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
        }
    }

    /// Append an upload-speed observation.
    pub fn record(&mut self, now: f64, speed: f64) {
        if self.samples.len() == MULTI_WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back((now, speed));
    }

    const fn weights(phase: Phase) -> [f64; 4] {
        match phase {
            Phase::Warmup => [0.10, 0.20, 0.30, 0.40],
            Phase::Catch => [0.20, 0.30, 0.30, 0.20],
            Phase::Steady => [0.30, 0.30, 0.20, 0.20],
            Phase::Finish => [0.50, 0.30, 0.15, 0.05],
        }
    }

    /// Phase-weighted average speed; windows with no samples are skipped and
    /// their weight is excluded from the normaliser.
    #[must_use]
    pub fn weighted_avg(&self, now: f64, phase: Phase) -> f64 {
        let weights = Self::weights(phase);
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for (window, weight) in WINDOWS.iter().zip(weights) {
            let mut sum = 0.0;
            let mut count = 0usize;
            for (at, speed) in self.samples.iter().rev() {
                if now - at > *window {
                    break;
                }
                sum += speed;
                count += 1;
            }
            if count > 0 {
                weighted_sum += (sum / count as f64) * weight;
                total_weight += weight;
            }
        }
        if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        }
    }

    /// Relative speed movement over the trailing `window` seconds: the last
    /// half's average against the first half's. Zero when fewer than five
    /// samples are available.
    #[must_use]
    pub fn recent_trend(&self, now: f64, window: f64) -> f64 {
        let recent: Vec<f64> = self
            .samples
            .iter()
            .filter(|(at, _)| now - at <= window)
            .map(|&(_, speed)| speed)
            .collect();
        if recent.len() < 5 {
            return 0.0;
        }
        let mid = recent.len() / 2;
        let first = recent[..mid].iter().sum::<f64>() / mid as f64;
        let second = recent[mid..].iter().sum::<f64>() / (recent.len() - mid) as f64;
        safe_div(second - first, first, 0.0)
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for MultiWindowTracker {
    fn default() -> Self {
        Self::new()
    }
}
