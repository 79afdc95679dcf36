use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::model::{ClientInstance, TorrentProperties, TorrentSummary};
use crate::{ClientAdapter, ClientError, ClientResult};

/// One recorded batched limit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitCall {
    /// Instance the call went to.
    pub client_id: u32,
    /// Hashes the limit was applied to.
    pub hashes: Vec<String>,
    /// Limit value, bytes/second (`<= 0` unlimited).
    pub bps: i64,
}

#[derive(Default)]
struct StubInstance {
    name: String,
    torrents: HashMap<String, TorrentSummary>,
    reannounce_in: HashMap<String, f64>,
    order: Vec<String>,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<u32, StubInstance>,
    upload_calls: Vec<LimitCall>,
    download_calls: Vec<LimitCall>,
    reannounces: Vec<(u32, String)>,
    fail_next: Option<&'static str>,
}

/// Scriptable in-memory client used by the engine tests.
///
/// Tests mutate the torrent table between ticks to simulate live counters and
/// read back the recorded limit calls to assert on batching behaviour.
#[derive(Clone, Default)]
pub struct StubClient {
    inner: Arc<Mutex<Inner>>,
}

impl StubClient {
    /// Empty stub with no instances.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a connected instance.
    pub fn add_instance(&self, id: u32, name: &str) {
        self.lock().instances.entry(id).or_default().name = name.to_string();
    }

    /// Insert or replace a torrent on an instance.
    pub fn upsert_torrent(&self, client_id: u32, torrent: TorrentSummary) {
        let mut inner = self.lock();
        let instance = inner.instances.entry(client_id).or_default();
        if !instance.torrents.contains_key(&torrent.hash) {
            instance.order.push(torrent.hash.clone());
        }
        instance.torrents.insert(torrent.hash.clone(), torrent);
    }

    /// Mutate a torrent in place; no-op when absent.
    pub fn update_torrent(
        &self,
        client_id: u32,
        hash: &str,
        mutate: impl FnOnce(&mut TorrentSummary),
    ) {
        let mut inner = self.lock();
        if let Some(instance) = inner.instances.get_mut(&client_id)
            && let Some(torrent) = instance.torrents.get_mut(hash)
        {
            mutate(torrent);
        }
    }

    /// Current view of a torrent, including applied limits.
    #[must_use]
    pub fn torrent(&self, client_id: u32, hash: &str) -> Option<TorrentSummary> {
        let inner = self.lock();
        inner
            .instances
            .get(&client_id)
            .and_then(|instance| instance.torrents.get(hash))
            .cloned()
    }

    /// Remove a torrent from an instance.
    pub fn remove_torrent(&self, client_id: u32, hash: &str) {
        let mut inner = self.lock();
        if let Some(instance) = inner.instances.get_mut(&client_id) {
            instance.torrents.remove(hash);
            instance.order.retain(|h| h != hash);
        }
    }

    /// Script the announce countdown returned by `properties`.
    pub fn set_reannounce_in(&self, client_id: u32, hash: &str, seconds: f64) {
        let mut inner = self.lock();
        if let Some(instance) = inner.instances.get_mut(&client_id) {
            instance.reannounce_in.insert(hash.to_string(), seconds);
        }
    }

    /// Make the next adapter call fail with an RPC error.
    pub fn fail_next(&self, reason: &'static str) {
        self.lock().fail_next = Some(reason);
    }

    /// Recorded upload-limit calls, in order.
    #[must_use]
    pub fn upload_calls(&self) -> Vec<LimitCall> {
        self.lock().upload_calls.clone()
    }

    /// Recorded download-limit calls, in order.
    #[must_use]
    pub fn download_calls(&self) -> Vec<LimitCall> {
        self.lock().download_calls.clone()
    }

    /// Recorded forced reannounces, in order.
    #[must_use]
    pub fn reannounces(&self) -> Vec<(u32, String)> {
        self.lock().reannounces.clone()
    }

    /// Drop recorded calls, keeping the torrent tables.
    pub fn clear_calls(&self) {
        let mut inner = self.lock();
        inner.upload_calls.clear();
        inner.download_calls.clear();
        inner.reannounces.clear();
    }

    fn take_failure(inner: &mut Inner) -> ClientResult<()> {
        if let Some(reason) = inner.fail_next.take() {
            return Err(ClientError::Rpc(reason.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientAdapter for StubClient {
    async fn instances(&self) -> Vec<ClientInstance> {
        let inner = self.lock();
        let mut ids: Vec<_> = inner.instances.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| ClientInstance {
                id,
                name: inner.instances[&id].name.clone(),
                connected: true,
                last_error: None,
            })
            .collect()
    }

    async fn active_torrents(&self, client_id: u32) -> ClientResult<Vec<TorrentSummary>> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        let instance = inner
            .instances
            .get(&client_id)
            .ok_or(ClientError::Unavailable(client_id))?;
        Ok(instance
            .order
            .iter()
            .filter_map(|hash| instance.torrents.get(hash))
            .filter(|torrent| torrent.is_active())
            .cloned()
            .collect())
    }

    async fn properties(&self, client_id: u32, hash: &str) -> ClientResult<TorrentProperties> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        let instance = inner
            .instances
            .get(&client_id)
            .ok_or(ClientError::Unavailable(client_id))?;
        let reannounce_in = instance
            .reannounce_in
            .get(hash)
            .copied()
            .ok_or_else(|| ClientError::Rpc(format!("no properties for {hash}")))?;
        Ok(TorrentProperties {
            reannounce_in,
            seeding_time: None,
        })
    }

    async fn set_upload_limit(
        &self,
        client_id: u32,
        hashes: &[String],
        bps: i64,
    ) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        if !inner.instances.contains_key(&client_id) {
            return Err(ClientError::Unavailable(client_id));
        }
        inner.upload_calls.push(LimitCall {
            client_id,
            hashes: hashes.to_vec(),
            bps,
        });
        if let Some(instance) = inner.instances.get_mut(&client_id) {
            for hash in hashes {
                if let Some(torrent) = instance.torrents.get_mut(hash) {
                    torrent.up_limit = bps;
                }
            }
        }
        Ok(())
    }

    async fn set_download_limit(
        &self,
        client_id: u32,
        hashes: &[String],
        bps: i64,
    ) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        if !inner.instances.contains_key(&client_id) {
            return Err(ClientError::Unavailable(client_id));
        }
        inner.download_calls.push(LimitCall {
            client_id,
            hashes: hashes.to_vec(),
            bps,
        });
        if let Some(instance) = inner.instances.get_mut(&client_id) {
            for hash in hashes {
                if let Some(torrent) = instance.torrents.get_mut(hash) {
                    torrent.dl_limit = bps;
                }
            }
        }
        Ok(())
    }

    async fn reannounce(&self, client_id: u32, hash: &str) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        if !inner.instances.contains_key(&client_id) {
            return Err(ClientError::Unavailable(client_id));
        }
        inner.reannounces.push((client_id, hash.to_string()));
        Ok(())
    }

    async fn free_space(&self, client_id: u32) -> ClientResult<u64> {
        let inner = self.lock();
        if !inner.instances.contains_key(&client_id) {
            return Err(ClientError::Unavailable(client_id));
        }
        Ok(512 * 1024 * 1024 * 1024)
    }

    async fn version(&self, client_id: u32) -> ClientResult<String> {
        let inner = self.lock();
        if !inner.instances.contains_key(&client_id) {
            return Err(ClientError::Unavailable(client_id));
        }
        Ok("v5.0.0-stub".to_string())
    }
}
