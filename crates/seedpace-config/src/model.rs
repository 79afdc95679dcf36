use std::collections::HashSet;
use std::path::PathBuf;

use seedpace_control::ControlTuning;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// One BitTorrent client instance to supervise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Stable identifier referenced by persisted torrent state.
    pub id: u32,
    /// Display name used in logs and notifications.
    pub name: String,
    /// Base URL of the client WebUI API.
    pub url: String,
    /// WebUI username.
    #[serde(default)]
    pub username: String,
    /// WebUI password.
    #[serde(default)]
    pub password: String,
    /// Disabled instances are ignored by the engine.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One tracker site the supervisor knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Stable site identifier referenced by rules and persisted state.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Substring matched against torrent tracker URLs to attribute a site.
    #[serde(default)]
    pub keyword: String,
    /// Site base URL; its host doubles as a tracker matcher.
    #[serde(default)]
    pub site_url: String,
    /// Opaque cookie string handed to the site adapter.
    #[serde(default)]
    pub cookie: String,
    /// Whether the reannounce optimiser may act for this site.
    #[serde(default = "default_true")]
    pub reannounce_opt: bool,
    /// Whether the download limiter may act for this site.
    #[serde(default = "default_true")]
    pub dl_limit: bool,
    /// Hard per-session ceiling override, bytes/second.
    #[serde(default)]
    pub speed_limit_bps: Option<i64>,
    /// Disabled sites are ignored by the engine.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A speed target rule; `site_id = None` is the default rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedRule {
    /// Stable rule identifier.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Site the rule applies to; `None` applies to everything unmatched.
    #[serde(default)]
    pub site_id: Option<u32>,
    /// Target average upload speed, KiB/s.
    pub target_kib: i64,
    /// Multiplier applied on top of the target.
    #[serde(default = "default_margin")]
    pub safety_margin: f64,
    /// Disabled rules are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SpeedRule {
    /// Effective target in bytes/second (before precision bias).
    #[must_use]
    pub fn target_bps(&self) -> f64 {
        self.target_kib as f64 * 1_024.0 * self.safety_margin
    }
}

/// Engine tunables. Defaults are the protocol constants; the hand-tuned
/// buffers are deliberately configurable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Hard per-session upload ceiling, bytes/second.
    pub speed_limit_bps: i64,
    /// Download-limiter minimum ETA before a cap is considered, seconds.
    pub dl_limit_min_time: f64,
    /// Download-limiter slack added when first applying a cap, seconds.
    pub dl_limit_buffer: f64,
    /// Download-limiter slack used when tightening an active cap, seconds.
    pub dl_limit_adjust_buffer: f64,
    /// Smallest download cap ever applied, KiB/s.
    pub dl_limit_min_kib: i64,
    /// Assumed drain rate while waiting for the average to recover,
    /// bytes/second.
    pub recovery_slope_bps: f64,
    /// Global budget for heavy per-torrent RPCs, calls/second.
    pub api_rate_limit: u32,
    /// Seconds between state persists.
    pub save_interval: f64,
    /// Seconds between site cookie checks.
    pub cookie_check_interval: f64,
    /// Seconds after which an unseen torrent state is evicted.
    pub evict_after: f64,
    /// Bounded length of the cycle-history log.
    pub history_limit: usize,
    /// Control-stack tuning.
    pub tuning: ControlTuning,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            speed_limit_bps: 50 * 1024 * 1024,
            dl_limit_min_time: 20.0,
            dl_limit_buffer: 30.0,
            dl_limit_adjust_buffer: 60.0,
            dl_limit_min_kib: 512,
            recovery_slope_bps: 45.0 * 1024.0 * 1024.0,
            api_rate_limit: 20,
            save_interval: 180.0,
            cookie_check_interval: 3_600.0,
            evict_after: 7_200.0,
            history_limit: 2_000,
            tuning: ControlTuning::default(),
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Client instances to supervise.
    pub clients: Vec<ClientConfig>,
    /// Known tracker sites.
    pub sites: Vec<SiteConfig>,
    /// Speed rules.
    pub rules: Vec<SpeedRule>,
    /// Engine tunables.
    pub settings: EngineSettings,
    /// Directory for persisted engine state.
    pub state_dir: PathBuf,
}

impl AppConfig {
    /// Check cross-entity consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on duplicate identifiers or rules
    /// pointing at unknown sites.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut client_ids = HashSet::new();
        for client in &self.clients {
            if !client_ids.insert(client.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate client id {}",
                    client.id
                )));
            }
        }
        let mut site_ids = HashSet::new();
        for site in &self.sites {
            if !site_ids.insert(site.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate site id {}",
                    site.id
                )));
            }
        }
        let mut default_rules = 0usize;
        for rule in &self.rules {
            if rule.target_kib < 0 {
                return Err(ConfigError::Validation(format!(
                    "rule {} has a negative target",
                    rule.id
                )));
            }
            match rule.site_id {
                Some(site_id) if !site_ids.contains(&site_id) => {
                    return Err(ConfigError::Validation(format!(
                        "rule {} references unknown site {site_id}",
                        rule.id
                    )));
                }
                Some(_) => {}
                None => default_rules += 1,
            }
        }
        if default_rules > 1 {
            return Err(ConfigError::Validation(
                "more than one default rule".to_string(),
            ));
        }
        Ok(())
    }
}

const fn default_true() -> bool {
    true
}

const fn default_margin() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: u32, keyword: &str) -> SiteConfig {
        SiteConfig {
            id,
            name: format!("site-{id}"),
            keyword: keyword.to_string(),
            site_url: String::new(),
            cookie: String::new(),
            reannounce_opt: true,
            dl_limit: true,
            speed_limit_bps: None,
            enabled: true,
        }
    }

    fn rule(id: u32, site_id: Option<u32>) -> SpeedRule {
        SpeedRule {
            id,
            name: format!("rule-{id}"),
            site_id,
            target_kib: 51_200,
            safety_margin: 1.0,
            enabled: true,
        }
    }

    #[test]
    fn target_bps_applies_margin() {
        let mut r = rule(1, None);
        r.safety_margin = 1.02;
        let expected = 51_200.0 * 1_024.0 * 1.02;
        assert!((r.target_bps() - expected).abs() < 1e-6);
    }

    #[test]
    fn rule_must_reference_known_site() {
        let config = AppConfig {
            sites: vec![site(1, "example")],
            rules: vec![rule(1, Some(2))],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn single_default_rule_allowed() {
        let config = AppConfig {
            rules: vec![rule(1, None), rule(2, None)],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            rules: vec![rule(1, None)],
            ..AppConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
