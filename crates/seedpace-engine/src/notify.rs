//! Per-(kind, key) minimum-interval gating for notification events.
//!
//! The engine evaluates noisy conditions every tick; without a gate a
//! persistent overspeed would emit a warning at tick frequency. Intervals
//! follow the documented notification contract: overspeed once per 120 s per
//! torrent, download-limit and forced-reannounce once per 60 s per torrent,
//! cookie-invalid once per hour per site.

use std::collections::HashMap;

/// Minimum interval between overspeed warnings per torrent, seconds.
pub const OVERSPEED_INTERVAL: f64 = 120.0;

/// Minimum interval between download-limit notices per torrent, seconds.
pub const DL_LIMIT_INTERVAL: f64 = 60.0;

/// Minimum interval between reannounce notices per torrent, seconds.
pub const REANNOUNCE_INTERVAL: f64 = 60.0;

/// Minimum interval between cookie-invalid notices per site, seconds.
pub const COOKIE_INTERVAL: f64 = 3_600.0;

/// Tracks the last emission instant per (event kind, subject key).
#[derive(Debug, Default)]
pub struct NotificationGate {
    last_sent: HashMap<(&'static str, String), f64>,
}

impl NotificationGate {
    /// Empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an event of `kind` for `key` may be emitted at `now`;
    /// records the emission when allowed.
    pub fn allow(&mut self, kind: &'static str, key: &str, now: f64, interval: f64) -> bool {
        match self.last_sent.get(&(kind, key.to_string())) {
            Some(&last) if now - last < interval => false,
            _ => {
                self.last_sent.insert((kind, key.to_string()), now);
                true
            }
        }
    }

    /// Drop entries older than the longest gating interval to bound memory.
    pub fn prune(&mut self, now: f64) {
        self.last_sent
            .retain(|_, &mut last| now - last < COOKIE_INTERVAL * 2.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_enforces_interval_per_key() {
        let mut gate = NotificationGate::new();
        assert!(gate.allow("overspeed", "hash-a", 100.0, 120.0));
        assert!(!gate.allow("overspeed", "hash-a", 150.0, 120.0));
        assert!(gate.allow("overspeed", "hash-b", 150.0, 120.0));
        assert!(gate.allow("overspeed", "hash-a", 221.0, 120.0));
    }

    #[test]
    fn kinds_are_gated_independently() {
        let mut gate = NotificationGate::new();
        assert!(gate.allow("overspeed", "hash-a", 100.0, 120.0));
        assert!(gate.allow("dl_limit", "hash-a", 100.0, 60.0));
    }

    #[test]
    fn prune_drops_stale_entries() {
        let mut gate = NotificationGate::new();
        assert!(gate.allow("cookie", "site-1", 0.0, COOKIE_INTERVAL));
        gate.prune(COOKIE_INTERVAL * 3.0);
        assert!(gate.allow("cookie", "site-1", COOKIE_INTERVAL * 3.0, COOKIE_INTERVAL));
    }
}
