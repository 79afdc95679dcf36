use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use seedpace_client::{
    ClientAdapter, ClientError, ClientInstance, ClientResult, TorrentProperties, TorrentSummary,
};
use seedpace_config::ClientConfig;

use crate::client::QbitClient;

struct Managed {
    name: String,
    client: QbitClient,
    connected: bool,
    last_error: Option<String>,
}

/// [`ClientAdapter`] over a set of configured qBittorrent instances.
///
/// Connection state is tracked per instance: a failed call marks the
/// instance disconnected, a successful one marks it connected again, so a
/// flapping client heals without any explicit reconnect pass.
pub struct QbitManager {
    instances: Mutex<HashMap<u32, Managed>>,
    order: Vec<u32>,
}

impl QbitManager {
    /// Build managers for every enabled instance in the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when an instance URL does not parse; connection
    /// failures are recorded per instance, not surfaced here.
    pub fn from_config(clients: &[ClientConfig]) -> ClientResult<Self> {
        let mut instances = HashMap::new();
        let mut order = Vec::new();
        for config in clients.iter().filter(|config| config.enabled) {
            let client = QbitClient::new(
                config.id,
                &config.url,
                config.username.clone(),
                config.password.clone(),
            )?;
            instances.insert(
                config.id,
                Managed {
                    name: config.name.clone(),
                    client,
                    connected: false,
                    last_error: None,
                },
            );
            order.push(config.id);
        }
        Ok(Self {
            instances: Mutex::new(instances),
            order,
        })
    }

    /// Attempt to log in to every instance, recording per-instance outcomes.
    pub async fn connect_all(&self) {
        for id in self.order.clone() {
            let Some(client) = self.client_handle(id) else {
                continue;
            };
            let result = client.login().await;
            match &result {
                Ok(()) => info!(instance = id, "client connected"),
                Err(error) => warn!(instance = id, error = %error, "client connect failed"),
            }
            self.mark_outcome(id, &result);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Managed>> {
        match self.instances.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn client_handle(&self, client_id: u32) -> Option<QbitClient> {
        let instances = self.lock();
        instances
            .get(&client_id)
            .map(|managed| managed.client.clone())
    }

    fn mark_outcome<T>(&self, client_id: u32, result: &ClientResult<T>) {
        let mut instances = self.lock();
        if let Some(managed) = instances.get_mut(&client_id) {
            match result {
                Ok(_) => {
                    managed.connected = true;
                    managed.last_error = None;
                }
                Err(error) => {
                    managed.connected = false;
                    managed.last_error = Some(error.to_string());
                }
            }
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $client_id:ident, $call:ident ( $($arg:expr),* )) => {{
        let client = $self
            .client_handle($client_id)
            .ok_or(ClientError::Unavailable($client_id))?;
        let result = client.$call($($arg),*).await;
        $self.mark_outcome($client_id, &result);
        result
    }};
}

#[async_trait]
impl ClientAdapter for QbitManager {
    async fn instances(&self) -> Vec<ClientInstance> {
        let instances = self.lock();
        self.order
            .iter()
            .filter_map(|id| {
                instances.get(id).map(|managed| ClientInstance {
                    id: *id,
                    name: managed.name.clone(),
                    connected: managed.connected,
                    last_error: managed.last_error.clone(),
                })
            })
            .collect()
    }

    async fn active_torrents(&self, client_id: u32) -> ClientResult<Vec<TorrentSummary>> {
        let result = dispatch!(self, client_id, torrents_info(Some("active")));
        result.map(|torrents| torrents.into_iter().map(TorrentSummary::from).collect())
    }

    async fn properties(&self, client_id: u32, hash: &str) -> ClientResult<TorrentProperties> {
        let result = dispatch!(self, client_id, torrent_properties(hash));
        result.map(TorrentProperties::from)
    }

    async fn set_upload_limit(
        &self,
        client_id: u32,
        hashes: &[String],
        bps: i64,
    ) -> ClientResult<()> {
        dispatch!(self, client_id, set_upload_limit(hashes, bps))
    }

    async fn set_download_limit(
        &self,
        client_id: u32,
        hashes: &[String],
        bps: i64,
    ) -> ClientResult<()> {
        dispatch!(self, client_id, set_download_limit(hashes, bps))
    }

    async fn reannounce(&self, client_id: u32, hash: &str) -> ClientResult<()> {
        dispatch!(self, client_id, reannounce(hash))
    }

    async fn free_space(&self, client_id: u32) -> ClientResult<u64> {
        dispatch!(self, client_id, free_space())
    }

    async fn version(&self, client_id: u32) -> ClientResult<String> {
        dispatch!(self, client_id, app_version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: u32, enabled: bool) -> ClientConfig {
        ClientConfig {
            id,
            name: format!("qb-{id}"),
            url: format!("http://127.0.0.1:{}", 8_080 + id),
            username: "admin".into(),
            password: "secret".into(),
            enabled,
        }
    }

    #[tokio::test]
    async fn disabled_instances_are_skipped() {
        let manager =
            QbitManager::from_config(&[config(1, true), config(2, false)]).expect("manager");
        let instances = manager.instances().await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, 1);
        assert!(!instances[0].connected);
    }

    #[tokio::test]
    async fn unknown_instance_is_unavailable() {
        let manager = QbitManager::from_config(&[config(1, true)]).expect("manager");
        assert!(matches!(
            manager.free_space(9).await,
            Err(ClientError::Unavailable(9))
        ));
    }

    #[test]
    fn bad_url_fails_fast() {
        let mut broken = config(1, true);
        broken.url = "::not-a-url::".into();
        assert!(QbitManager::from_config(&[broken]).is_err());
    }
}
