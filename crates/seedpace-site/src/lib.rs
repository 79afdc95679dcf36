#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Site adapter contract for tracker-assisted reannounce timing.
//!
//! A site adapter is strictly best-effort: the engine asks it to resolve a
//! torrent id from an info-hash, to read the peerlist (which carries the last
//! announce time the tracker actually recorded), and to validate the stored
//! cookie. Adapters are value-typed implementations behind one trait,
//! assembled into a [`SiteRegistry`] keyed by tracker-substring match; there
//! is no runtime plugin registration.
//!
//! The HTML-scraping adapters themselves are collaborator crates; this crate
//! ships the contract and the scripted [`StubSite`] the engine tests use.

mod stub;

pub use stub::StubSite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors surfaced by site adapters; all are treated as best-effort misses.
#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    /// Transport failure against the site.
    #[error("site request failed: {0}")]
    Http(String),
    /// The stored cookie no longer authenticates.
    #[error("site cookie rejected")]
    CookieRejected,
    /// The site answered with something unexpected.
    #[error("site response not understood: {0}")]
    Parse(String),
}

/// Result alias for site adapter calls.
pub type SiteResult<T> = Result<T, SiteError>;

/// Listing data resolved from an info-hash search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentListing {
    /// Site-local torrent id.
    pub tid: i64,
    /// Promotion badge, when the site shows one.
    pub promotion: Option<String>,
    /// Publish time, Unix epoch.
    pub publish_time: Option<f64>,
}

/// Peerlist data for our own seed entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerlistInfo {
    /// Uploaded bytes as accounted by the site.
    pub uploaded_on_site: Option<u64>,
    /// Unix epoch of the last announce the tracker recorded.
    pub last_announce_time: Option<f64>,
    /// Seconds until the next announce, when the site exposes it.
    pub reannounce_in: Option<f64>,
}

/// Narrow best-effort interface onto one tracker site.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Configured site this adapter serves.
    fn site_id(&self) -> u32;

    /// Resolve a torrent listing from a 40-hex info-hash.
    async fn search_by_hash(&self, hash: &str) -> SiteResult<Option<TorrentListing>>;

    /// Fetch our peerlist entry for a resolved torrent id.
    async fn peerlist(&self, tid: i64) -> SiteResult<Option<PeerlistInfo>>;

    /// Whether the stored cookie still authenticates.
    async fn check_cookie(&self) -> SiteResult<bool>;
}

/// Fixed table of site adapters keyed by tracker-substring match.
#[derive(Clone, Default)]
pub struct SiteRegistry {
    matchers: Vec<(String, u32)>,
    by_id: HashMap<u32, Arc<dyn SiteAdapter>>,
}

impl SiteRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under a lowercase tracker keyword.
    pub fn register(&mut self, keyword: impl Into<String>, adapter: Arc<dyn SiteAdapter>) {
        let keyword = keyword.into().trim().to_lowercase();
        if !keyword.is_empty() {
            self.matchers.push((keyword, adapter.site_id()));
        }
        self.by_id.insert(adapter.site_id(), adapter);
    }

    /// Adapter for a known site id.
    #[must_use]
    pub fn by_id(&self, site_id: u32) -> Option<Arc<dyn SiteAdapter>> {
        self.by_id.get(&site_id).cloned()
    }

    /// Adapter whose keyword occurs in the tracker URL.
    #[must_use]
    pub fn by_tracker(&self, tracker: &str) -> Option<Arc<dyn SiteAdapter>> {
        let tracker = tracker.to_lowercase();
        if tracker.is_empty() {
            return None;
        }
        self.matchers
            .iter()
            .find(|(keyword, _)| tracker.contains(keyword))
            .and_then(|&(_, site_id)| self.by_id(site_id))
    }

    /// All registered adapters.
    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn SiteAdapter>> {
        self.by_id.values()
    }

    /// Whether any adapter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_matches_by_substring_and_id() {
        let mut registry = SiteRegistry::new();
        let alpha = Arc::new(StubSite::new(1));
        alpha.set_listing(
            "a".repeat(40).as_str(),
            TorrentListing {
                tid: 42,
                promotion: Some("free".into()),
                publish_time: None,
            },
        );
        registry.register("alpha.example", alpha);
        registry.register("beta", Arc::new(StubSite::new(2)));

        let adapter = registry
            .by_tracker("https://Alpha.Example/announce?passkey=x")
            .expect("matched");
        assert_eq!(adapter.site_id(), 1);
        let listing = adapter
            .search_by_hash(&"a".repeat(40))
            .await
            .expect("search")
            .expect("found");
        assert_eq!(listing.tid, 42);

        assert!(registry.by_tracker("udp://gamma.example").is_none());
        assert!(registry.by_id(2).is_some());
        assert!(!registry.is_empty());
    }

    #[tokio::test]
    async fn stub_scripts_peerlist_and_cookie() {
        let site = StubSite::new(7);
        site.set_peerlist(
            42,
            PeerlistInfo {
                uploaded_on_site: Some(1_024),
                last_announce_time: Some(1_700_000_000.0),
                reannounce_in: Some(900.0),
            },
        );
        let info = site.peerlist(42).await.expect("peerlist").expect("entry");
        assert_eq!(info.reannounce_in, Some(900.0));
        assert!(site.peerlist(43).await.expect("peerlist").is_none());

        assert!(site.check_cookie().await.expect("cookie"));
        site.set_cookie_valid(false);
        assert!(!site.check_cookie().await.expect("cookie"));
        assert!(site.search_by_hash("ffff").await.expect("miss").is_none());
    }
}
