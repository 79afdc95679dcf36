//! Background workers resolving best-effort site data.
//!
//! Two named tasks, each draining a bounded channel the tick loop feeds:
//! the tid worker resolves listings from info-hashes, the peerlist worker
//! reads our seed entry for torrents with a known tid. Both mutate only the
//! whitelisted site-resolved fields of a torrent's state, under the map
//! lock, and never make the tick wait.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use seedpace_site::{SiteAdapter, SiteRegistry};

use crate::TID_NOT_FOUND_CACHE;
use crate::engine::{Shared, lock};
use crate::state::{TimeLeftSource, TorrentState};
use crate::unix_now;

fn adapter_for(
    sites: &SiteRegistry,
    site_id: Option<u32>,
    tracker: &str,
) -> Option<Arc<dyn SiteAdapter>> {
    site_id
        .and_then(|id| sites.by_id(id))
        .or_else(|| sites.by_tracker(tracker))
}

pub(crate) fn spawn_tid_worker(
    shared: Arc<Shared>,
    sites: SiteRegistry,
    mut rx: mpsc::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(hash) = rx.recv().await {
            let identity = {
                let states = lock(&shared.states);
                states
                    .get(&hash)
                    .map(|state| (state.site_id, state.tracker.clone()))
            };
            let Some((site_id, tracker)) = identity else {
                continue;
            };
            let Some(adapter) = adapter_for(&sites, site_id, &tracker) else {
                continue;
            };

            match adapter.search_by_hash(&hash).await {
                Ok(Some(listing)) => {
                    let mut states = lock(&shared.states);
                    if let Some(state) = states.get_mut(&hash) {
                        state.tid_searched = true;
                        state.tid = Some(listing.tid);
                        if listing.promotion.is_some() {
                            state.promotion = listing.promotion;
                        }
                        if listing.publish_time.is_some() {
                            state.publish_time = listing.publish_time;
                        }
                        if state.site_id.is_none() {
                            state.site_id = Some(adapter.site_id());
                        }
                        debug!(hash = %hash, tid = state.tid, "resolved site torrent id");
                    }
                }
                Ok(None) => {
                    let mut states = lock(&shared.states);
                    if let Some(state) = states.get_mut(&hash) {
                        state.tid_searched = true;
                        state.tid_not_found_until = unix_now() + TID_NOT_FOUND_CACHE;
                        debug!(hash = %hash, "site does not know this torrent");
                    }
                }
                Err(error) => {
                    debug!(hash = %hash, error = %error, "tid search failed");
                }
            }
        }
    })
}

pub(crate) fn spawn_peer_worker(
    shared: Arc<Shared>,
    sites: SiteRegistry,
    mut rx: mpsc::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(hash) = rx.recv().await {
            let identity = {
                let states = lock(&shared.states);
                states.get(&hash).and_then(|state| {
                    state
                        .tid
                        .map(|tid| (state.site_id, state.tracker.clone(), tid))
                })
            };
            let Some((site_id, tracker, tid)) = identity else {
                continue;
            };
            let Some(adapter) = adapter_for(&sites, site_id, &tracker) else {
                continue;
            };

            match adapter.peerlist(tid).await {
                Ok(Some(info)) => {
                    let mut states = lock(&shared.states);
                    if let Some(state) = states.get_mut(&hash) {
                        merge_peerlist(state, info);
                    }
                }
                Ok(None) => {
                    debug!(hash = %hash, tid, "peerlist had no entry for us");
                }
                Err(error) => {
                    debug!(hash = %hash, error = %error, "peerlist fetch failed");
                }
            }
        }
    })
}

fn merge_peerlist(state: &mut TorrentState, info: seedpace_site::PeerlistInfo) {
    if let Some(last_announce) = info.last_announce_time.filter(|&at| at > 0.0) {
        state.last_announce_time = Some(last_announce);
    }
    if info.uploaded_on_site.is_some() {
        state.site_uploaded = info.uploaded_on_site;
    }
    if let Some(reannounce_in) = info.reannounce_in
        && TorrentState::time_left_valid(reannounce_in)
    {
        state.cached_time_left = reannounce_in;
        state.cache_timestamp = unix_now();
        state.time_left_source = TimeLeftSource::Site;
    }
    debug!(hash = %state.hash, announce = ?state.last_announce_time, "merged peerlist data");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use seedpace_client::StubClient;
    use seedpace_config::{AppConfig, ConfigService};
    use seedpace_control::ControlTuning;
    use seedpace_events::EventBus;
    use seedpace_site::{PeerlistInfo, StubSite, TorrentListing};
    use seedpace_store::{HistoryStore, StateStore};
    use tempfile::TempDir;

    use crate::engine::{EngineDeps, LimitEngine};

    fn registry_with(site: Arc<StubSite>) -> SiteRegistry {
        let mut registry = SiteRegistry::new();
        registry.register("alpha.example", site);
        registry
    }

    fn engine_with(sites: SiteRegistry) -> (Arc<LimitEngine>, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let deps = EngineDeps {
            client: Arc::new(StubClient::new()),
            sites,
            config: Arc::new(ConfigService::fixed(AppConfig::default())),
            store: StateStore::new(dir.path()),
            history: HistoryStore::new(dir.path(), 100),
            events: EventBus::with_capacity(64),
        };
        let engine = Arc::new(LimitEngine::new_at(deps, 1_000.0).expect("engine"));
        (engine, dir)
    }

    fn seed_state(engine: &LimitEngine, hash: &str, tid: Option<i64>) {
        let shared = engine.shared();
        let mut states = lock(&shared.states);
        let mut state = TorrentState::new(hash, &ControlTuning::default());
        state.tracker = "https://alpha.example/announce".to_string();
        state.tid = tid;
        states.insert(hash.to_string(), state);
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker did not converge in time");
    }

    #[tokio::test]
    async fn tid_worker_resolves_listing_into_state() {
        let site = Arc::new(StubSite::new(1));
        let hash = "a".repeat(40);
        site.set_listing(
            &hash,
            TorrentListing {
                tid: 777,
                promotion: Some("free".into()),
                publish_time: Some(1_600_000_000.0),
            },
        );
        let (engine, _dir) = engine_with(registry_with(Arc::clone(&site)));
        seed_state(&engine, &hash, None);

        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_tid_worker(engine.shared(), registry_with(site), rx);
        tx.send(hash.clone()).await.expect("send");

        let shared = engine.shared();
        wait_until(|| {
            let states = lock(&shared.states);
            states.get(&hash).is_some_and(|s| s.tid == Some(777))
        })
        .await;

        let states = lock(&shared.states);
        let state = &states[&hash];
        assert!(state.tid_searched);
        assert_eq!(state.promotion.as_deref(), Some("free"));
        assert_eq!(state.site_id, Some(1));
        drop(states);

        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn tid_worker_negative_caches_misses() {
        let site = Arc::new(StubSite::new(1));
        let hash = "b".repeat(40);
        let (engine, _dir) = engine_with(registry_with(Arc::clone(&site)));
        seed_state(&engine, &hash, None);

        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_tid_worker(engine.shared(), registry_with(site), rx);
        tx.send(hash.clone()).await.expect("send");

        let shared = engine.shared();
        wait_until(|| {
            let states = lock(&shared.states);
            states.get(&hash).is_some_and(|s| s.tid_searched)
        })
        .await;

        let states = lock(&shared.states);
        let state = &states[&hash];
        assert!(state.tid.is_none());
        assert!(state.tid_not_found_until > unix_now() + TID_NOT_FOUND_CACHE / 2.0);
        drop(states);

        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn peer_worker_merges_announce_time() {
        let site = Arc::new(StubSite::new(1));
        site.set_peerlist(
            777,
            PeerlistInfo {
                uploaded_on_site: Some(42),
                last_announce_time: Some(1_700_000_000.0),
                reannounce_in: Some(1_234.0),
            },
        );
        let hash = "c".repeat(40);
        let (engine, _dir) = engine_with(registry_with(Arc::clone(&site)));
        seed_state(&engine, &hash, Some(777));

        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_peer_worker(engine.shared(), registry_with(site), rx);
        tx.send(hash.clone()).await.expect("send");

        let shared = engine.shared();
        wait_until(|| {
            let states = lock(&shared.states);
            states
                .get(&hash)
                .is_some_and(|s| s.last_announce_time.is_some())
        })
        .await;

        let states = lock(&shared.states);
        let state = &states[&hash];
        assert_eq!(state.last_announce_time, Some(1_700_000_000.0));
        assert_eq!(state.site_uploaded, Some(42));
        assert_eq!(state.cached_time_left, 1_234.0);
        assert_eq!(state.time_left_source, TimeLeftSource::Site);
        drop(states);

        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn worker_skips_unknown_hashes() {
        let site = Arc::new(StubSite::new(1));
        let (engine, _dir) = engine_with(registry_with(Arc::clone(&site)));

        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_tid_worker(engine.shared(), registry_with(Arc::clone(&site)), rx);
        tx.send("d".repeat(40)).await.expect("send");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(site.searches(), 0);

        drop(tx);
        let _ = handle.await;
    }
}
