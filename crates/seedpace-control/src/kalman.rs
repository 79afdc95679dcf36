/// Constant-acceleration Kalman filter over the observed upload speed.
///
/// State is `[speed, accel]`; only the speed is measured. The filter smooths
/// the noisy per-tick speed readings and provides a short-horizon upload
/// prediction the finish-phase correction relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedKalman {
    /// Filtered speed estimate, bytes/second.
    pub speed: f64,
    /// Filtered acceleration estimate, bytes/second².
    pub accel: f64,
    p00: f64,
    p01: f64,
    p10: f64,
    p11: f64,
    q_speed: f64,
    q_accel: f64,
    r: f64,
    last_time: f64,
    initialized: bool,
}

const INITIAL_COVARIANCE: f64 = 1_000.0;

impl SpeedKalman {
    /// Construct a filter with the given noise parameters.
    #[must_use]
    pub fn new(q_speed: f64, q_accel: f64, r: f64) -> Self {
        Self {
            speed: 0.0,
            accel: 0.0,
            p00: INITIAL_COVARIANCE,
            p01: 0.0,
            p10: 0.0,
            p11: INITIAL_COVARIANCE,
            q_speed,
            q_accel,
            r,
            last_time: 0.0,
            initialized: false,
        }
    }

    /// Fold in a speed measurement taken at `now` (seconds).
    ///
    /// Returns the updated `(speed, accel)` estimate. The first sample
    /// initialises the state to the measurement with zero acceleration;
    /// samples closer than 10 ms apart are ignored.
    pub fn update(&mut self, measurement: f64, now: f64) -> (f64, f64) {
        if !self.initialized {
            self.speed = measurement;
            self.last_time = now;
            self.initialized = true;
            return (measurement, 0.0);
        }
        let dt = now - self.last_time;
        if dt <= 0.01 {
            return (self.speed, self.accel);
        }
        self.last_time = now;

        let pred_speed = self.speed + self.accel * dt;
        let p00_pred = self.p00 + dt * (self.p10 + self.p01) + dt * dt * self.p11 + self.q_speed;
        let p01_pred = self.p01 + dt * self.p11;
        let p10_pred = self.p10 + dt * self.p11;
        let p11_pred = self.p11 + self.q_accel;

        let s = p00_pred + self.r;
        if s.abs() < 1e-10 {
            return (self.speed, self.accel);
        }
        let k0 = p00_pred / s;
        let k1 = p10_pred / s;
        let innovation = measurement - pred_speed;

        // Speeds are magnitudes; measurement noise must not drive the
        // estimate below zero.
        self.speed = (pred_speed + k0 * innovation).max(0.0);
        self.accel += k1 * innovation;
        self.p00 = (1.0 - k0) * p00_pred;
        self.p01 = (1.0 - k0) * p01_pred;
        self.p10 = p10_pred - k1 * p00_pred;
        self.p11 = p11_pred - k1 * p01_pred;
        (self.speed, self.accel)
    }

    /// Bytes expected to upload over the next `time_left` seconds, never
    /// negative.
    #[must_use]
    pub fn predict_upload(&self, time_left: f64) -> f64 {
        (self.speed * time_left + 0.5 * self.accel * time_left * time_left).max(0.0)
    }

    /// Drop all learned state; the filter re-initialises on the next sample.
    pub fn reset(&mut self) {
        let q_speed = self.q_speed;
        let q_accel = self.q_accel;
        let r = self.r;
        *self = Self::new(q_speed, q_accel, r);
    }
}

impl Default for SpeedKalman {
    fn default() -> Self {
        Self::new(0.1, 0.05, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initialises_state() {
        let mut filter = SpeedKalman::default();
        let (speed, accel) = filter.update(1_000.0, 100.0);
        assert_eq!(speed, 1_000.0);
        assert_eq!(accel, 0.0);
    }

    #[test]
    fn converges_on_constant_speed() {
        let mut filter = SpeedKalman::default();
        let mut now = 0.0;
        for _ in 0..120 {
            now += 1.0;
            filter.update(5_000_000.0, now);
        }
        assert!((filter.speed - 5_000_000.0).abs() < 50_000.0);
        assert!(filter.accel.abs() < 10_000.0);
    }

    #[test]
    fn tracks_acceleration_under_ramp() {
        let mut filter = SpeedKalman::default();
        let mut now = 0.0;
        let mut speed = 1_000_000.0;
        for _ in 0..60 {
            now += 1.0;
            speed += 10_000.0;
            filter.update(speed, now);
        }
        assert!(filter.accel > 0.0, "ramp should yield positive acceleration");
        assert!(filter.speed > 1_000_000.0);
    }

    #[test]
    fn speed_and_prediction_never_negative() {
        let mut filter = SpeedKalman::default();
        let mut now = 0.0;
        for measurement in [100.0, 0.0, 0.0, 50.0, 0.0, 0.0, 0.0] {
            now += 1.0;
            filter.update(measurement, now);
            assert!(filter.speed >= 0.0, "speed dipped below zero");
        }
        assert!(filter.predict_upload(600.0) >= 0.0);
    }

    #[test]
    fn sub_centisecond_samples_are_ignored() {
        let mut filter = SpeedKalman::default();
        filter.update(1_000.0, 1.0);
        let before = filter.clone();
        filter.update(9_999.0, 1.005);
        assert_eq!(filter, before);
    }

    #[test]
    fn reset_forgets_everything() {
        let mut filter = SpeedKalman::default();
        filter.update(1_000.0, 1.0);
        filter.update(2_000.0, 2.0);
        filter.reset();
        let (speed, accel) = filter.update(42.0, 50.0);
        assert_eq!(speed, 42.0);
        assert_eq!(accel, 0.0);
    }
}
