use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::model::{AppConfig, EngineSettings, SiteConfig, SpeedRule};

/// Snapshot TTL: the engine tick re-reads configuration at most this often.
const SNAPSHOT_TTL: f64 = 10.0;

/// Pre-indexed view of the enabled rules and sites for one engine tick.
#[derive(Debug, Default)]
pub struct RulesSnapshot {
    rules_by_site: HashMap<Option<u32>, SpeedRule>,
    sites_by_id: HashMap<u32, SiteConfig>,
    matchers: Vec<(String, u32)>,
    /// Whether any enabled site allows download limiting.
    pub any_dl_limit: bool,
    /// Whether any enabled site allows reannounce optimisation.
    pub any_reannounce_opt: bool,
    /// Engine tunables at snapshot time.
    pub settings: EngineSettings,
}

impl RulesSnapshot {
    fn build(config: &AppConfig) -> Self {
        let mut rules_by_site = HashMap::new();
        for rule in config.rules.iter().filter(|rule| rule.enabled) {
            rules_by_site.insert(rule.site_id, rule.clone());
        }

        let mut sites_by_id = HashMap::new();
        let mut matchers = Vec::new();
        let mut any_dl_limit = false;
        let mut any_reannounce_opt = false;
        for site in config.sites.iter().filter(|site| site.enabled) {
            any_dl_limit |= site.dl_limit;
            any_reannounce_opt |= site.reannounce_opt;

            let keyword = site.keyword.trim().to_lowercase();
            if !keyword.is_empty() {
                matchers.push((keyword, site.id));
            }
            if let Some(host) = host_of(&site.site_url) {
                matchers.push((host, site.id));
            }
            sites_by_id.insert(site.id, site.clone());
        }

        Self {
            rules_by_site,
            sites_by_id,
            matchers,
            any_dl_limit,
            any_reannounce_opt,
            settings: config.settings.clone(),
        }
    }

    /// Attribute a tracker URL to a configured site by substring match.
    #[must_use]
    pub fn match_site(&self, tracker: &str) -> Option<u32> {
        let tracker = tracker.to_lowercase();
        if tracker.is_empty() {
            return None;
        }
        self.matchers
            .iter()
            .find(|(keyword, _)| tracker.contains(keyword))
            .map(|&(_, site_id)| site_id)
    }

    /// Rule for a site, falling back to the default rule.
    #[must_use]
    pub fn rule_for(&self, site_id: Option<u32>) -> Option<&SpeedRule> {
        site_id
            .and_then(|id| self.rules_by_site.get(&Some(id)))
            .or_else(|| self.rules_by_site.get(&None))
    }

    /// Site entry by id.
    #[must_use]
    pub fn site(&self, site_id: u32) -> Option<&SiteConfig> {
        self.sites_by_id.get(&site_id)
    }

    /// Enabled sites, in arbitrary order.
    pub fn sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites_by_id.values()
    }

    /// Hard ceiling for a torrent: the site override or the global setting.
    #[must_use]
    pub fn ceiling_bps(&self, site_id: Option<u32>) -> i64 {
        site_id
            .and_then(|id| self.sites_by_id.get(&id))
            .and_then(|site| site.speed_limit_bps)
            .unwrap_or(self.settings.speed_limit_bps)
    }

    /// The default rule, when one is configured.
    #[must_use]
    pub fn default_rule(&self) -> Option<&SpeedRule> {
        self.rules_by_site.get(&None)
    }
}

fn host_of(url: &str) -> Option<String> {
    let trimmed = url.trim().to_lowercase();
    if trimmed.is_empty() {
        return None;
    }
    let after_scheme = trimmed.split_once("://").map_or(trimmed.as_str(), |x| x.1);
    let host = after_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .trim_start_matches("www.");
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

enum Source {
    File(PathBuf),
    Fixed(AppConfig),
}

/// Serves [`RulesSnapshot`]s with a ten-second TTL.
///
/// File-backed in production so rule edits take effect within one TTL; the
/// fixed variant hands the engine tests a config without touching disk.
pub struct ConfigService {
    source: Source,
    cached: Mutex<Option<(f64, Arc<RulesSnapshot>)>>,
}

impl ConfigService {
    /// Service re-reading `path` when the snapshot expires.
    #[must_use]
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::File(path.into()),
            cached: Mutex::new(None),
        }
    }

    /// Service serving a fixed in-memory configuration.
    #[must_use]
    pub fn fixed(config: AppConfig) -> Self {
        Self {
            source: Source::Fixed(config),
            cached: Mutex::new(None),
        }
    }

    /// Current snapshot; rebuilt when older than the TTL.
    ///
    /// A file reload failure keeps the previous snapshot alive rather than
    /// dropping every rule mid-flight.
    pub fn snapshot(&self, now: f64) -> Arc<RulesSnapshot> {
        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((at, snapshot)) = cached.as_ref()
            && now - at < SNAPSHOT_TTL
        {
            return Arc::clone(snapshot);
        }

        let rebuilt = match &self.source {
            Source::Fixed(config) => Some(RulesSnapshot::build(config)),
            Source::File(path) => match crate::load(path) {
                Ok(config) => Some(RulesSnapshot::build(&config)),
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "config reload failed");
                    None
                }
            },
        };

        match rebuilt {
            Some(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *cached = Some((now, Arc::clone(&snapshot)));
                snapshot
            }
            None => cached.as_ref().map_or_else(
                || Arc::new(RulesSnapshot::default()),
                |(_, snapshot)| Arc::clone(snapshot),
            ),
        }
    }
}
