use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::{PeerlistInfo, SiteAdapter, SiteResult, TorrentListing};

/// Scriptable in-memory site adapter for the engine tests.
#[derive(Debug, Default)]
pub struct StubSite {
    site_id: u32,
    listings: Mutex<HashMap<String, TorrentListing>>,
    peerlists: Mutex<HashMap<i64, PeerlistInfo>>,
    cookie_valid: AtomicBool,
    searches: AtomicU32,
    peerlist_fetches: AtomicU32,
}

impl StubSite {
    /// Stub serving `site_id` with a valid cookie and no listings.
    #[must_use]
    pub fn new(site_id: u32) -> Self {
        Self {
            site_id,
            listings: Mutex::new(HashMap::new()),
            peerlists: Mutex::new(HashMap::new()),
            cookie_valid: AtomicBool::new(true),
            searches: AtomicU32::new(0),
            peerlist_fetches: AtomicU32::new(0),
        }
    }

    /// Script the listing returned for an info-hash.
    pub fn set_listing(&self, hash: &str, listing: TorrentListing) {
        self.lock_listings().insert(hash.to_lowercase(), listing);
    }

    /// Script the peerlist entry returned for a torrent id.
    pub fn set_peerlist(&self, tid: i64, info: PeerlistInfo) {
        self.lock_peerlists().insert(tid, info);
    }

    /// Script the cookie validity.
    pub fn set_cookie_valid(&self, valid: bool) {
        self.cookie_valid.store(valid, Ordering::Relaxed);
    }

    /// Number of hash searches served.
    #[must_use]
    pub fn searches(&self) -> u32 {
        self.searches.load(Ordering::Relaxed)
    }

    /// Number of peerlist fetches served.
    #[must_use]
    pub fn peerlist_fetches(&self) -> u32 {
        self.peerlist_fetches.load(Ordering::Relaxed)
    }

    fn lock_listings(&self) -> std::sync::MutexGuard<'_, HashMap<String, TorrentListing>> {
        match self.listings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_peerlists(&self) -> std::sync::MutexGuard<'_, HashMap<i64, PeerlistInfo>> {
        match self.peerlists.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SiteAdapter for StubSite {
    fn site_id(&self) -> u32 {
        self.site_id
    }

    async fn search_by_hash(&self, hash: &str) -> SiteResult<Option<TorrentListing>> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        Ok(self.lock_listings().get(&hash.to_lowercase()).cloned())
    }

    async fn peerlist(&self, tid: i64) -> SiteResult<Option<PeerlistInfo>> {
        self.peerlist_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.lock_peerlists().get(&tid).copied())
    }

    async fn check_cookie(&self) -> SiteResult<bool> {
        Ok(self.cookie_valid.load(Ordering::Relaxed))
    }
}
