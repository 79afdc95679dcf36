use reqwest::{Client as HttpClient, StatusCode};
use tracing::{debug, warn};
use url::Url;

use seedpace_client::{ClientError, ClientResult};

use crate::model::{QbitMainData, QbitTorrentInfo, QbitTorrentProperties};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// Session against one qBittorrent WebUI instance.
///
/// Authentication is cookie-based; the cookie jar lives inside the reqwest
/// client and is shared between clones, so a re-login from any handle
/// refreshes the session for all of them. Calls that come back `403`
/// re-login once and retry before surfacing the error.
#[derive(Clone)]
pub struct QbitClient {
    instance_id: u32,
    http: HttpClient,
    base_url: Url,
    username: String,
    password: String,
}

impl QbitClient {
    /// Build a client for `base_url` (e.g. `http://127.0.0.1:8080`).
    ///
    /// # Errors
    ///
    /// Returns an error when the URL does not parse or the HTTP client
    /// cannot be constructed.
    pub fn new(
        instance_id: u32,
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> ClientResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|error| ClientError::Rpc(format!("invalid client url: {error}")))?;
        let http = HttpClient::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| ClientError::Rpc(error.to_string()))?;
        Ok(Self {
            instance_id,
            http,
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    fn endpoint(&self, path: &str) -> ClientResult<Url> {
        self.base_url
            .join(path)
            .map_err(|error| ClientError::Rpc(format!("bad endpoint {path}: {error}")))
    }

    /// Authenticate and populate the cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Auth`] when the credentials are rejected.
    pub async fn login(&self) -> ClientResult<()> {
        let url = self.endpoint("api/v2/auth/login")?;
        let response = self
            .http
            .post(url)
            .header("Referer", self.base_url.to_string())
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|error| ClientError::Rpc(error.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::Auth(self.instance_id));
        }
        let body = response
            .text()
            .await
            .map_err(|error| ClientError::Rpc(error.to_string()))?;
        if body.trim() == "Fails." {
            return Err(ClientError::Auth(self.instance_id));
        }
        debug!(instance = self.instance_id, "qbittorrent login ok");
        Ok(())
    }

    async fn get_with_relogin(&self, path: &str, query: &[(&str, &str)]) -> ClientResult<String> {
        let url = self.endpoint(path)?;
        for attempt in 0..2 {
            let response = self
                .http
                .get(url.clone())
                .query(query)
                .send()
                .await
                .map_err(|error| ClientError::Rpc(error.to_string()))?;
            match response.status() {
                StatusCode::FORBIDDEN if attempt == 0 => {
                    debug!(instance = self.instance_id, path, "session expired; re-login");
                    self.login().await?;
                }
                status if status.is_success() => {
                    return response
                        .text()
                        .await
                        .map_err(|error| ClientError::Rpc(error.to_string()));
                }
                status => {
                    return Err(ClientError::Rpc(format!("{path} returned {status}")));
                }
            }
        }
        Err(ClientError::Auth(self.instance_id))
    }

    async fn post_form_with_relogin(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> ClientResult<()> {
        let url = self.endpoint(path)?;
        for attempt in 0..2 {
            let response = self
                .http
                .post(url.clone())
                .form(form)
                .send()
                .await
                .map_err(|error| ClientError::Rpc(error.to_string()))?;
            match response.status() {
                StatusCode::FORBIDDEN if attempt == 0 => {
                    debug!(instance = self.instance_id, path, "session expired; re-login");
                    self.login().await?;
                }
                status if status.is_success() => return Ok(()),
                status => {
                    return Err(ClientError::Rpc(format!("{path} returned {status}")));
                }
            }
        }
        Err(ClientError::Auth(self.instance_id))
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, path: &str, body: &str) -> ClientResult<T> {
        serde_json::from_str(body).map_err(|error| {
            warn!(instance = self.instance_id, path, error = %error, "undecodable client payload");
            ClientError::Decode(format!("{path}: {error}"))
        })
    }

    /// Torrent list, optionally restricted by the WebUI filter keyword.
    ///
    /// # Errors
    ///
    /// Transport, auth, or decode failures.
    pub async fn torrents_info(&self, filter: Option<&str>) -> ClientResult<Vec<QbitTorrentInfo>> {
        let query: Vec<(&str, &str)> = filter.map(|value| ("filter", value)).into_iter().collect();
        let body = self.get_with_relogin("api/v2/torrents/info", &query).await?;
        self.decode("api/v2/torrents/info", &body)
    }

    /// Per-torrent properties, including the announce countdown.
    ///
    /// # Errors
    ///
    /// Transport, auth, or decode failures.
    pub async fn torrent_properties(&self, hash: &str) -> ClientResult<QbitTorrentProperties> {
        let body = self
            .get_with_relogin("api/v2/torrents/properties", &[("hash", hash)])
            .await?;
        self.decode("api/v2/torrents/properties", &body)
    }

    /// Apply one upload limit to a batch of hashes.
    ///
    /// # Errors
    ///
    /// Transport or auth failures.
    pub async fn set_upload_limit(&self, hashes: &[String], bps: i64) -> ClientResult<()> {
        self.post_form_with_relogin(
            "api/v2/torrents/setUploadLimit",
            &[
                ("hashes", join_hashes(hashes)),
                ("limit", qbit_limit(bps).to_string()),
            ],
        )
        .await
    }

    /// Apply one download limit to a batch of hashes.
    ///
    /// # Errors
    ///
    /// Transport or auth failures.
    pub async fn set_download_limit(&self, hashes: &[String], bps: i64) -> ClientResult<()> {
        self.post_form_with_relogin(
            "api/v2/torrents/setDownloadLimit",
            &[
                ("hashes", join_hashes(hashes)),
                ("limit", qbit_limit(bps).to_string()),
            ],
        )
        .await
    }

    /// Force a tracker reannounce.
    ///
    /// # Errors
    ///
    /// Transport or auth failures.
    pub async fn reannounce(&self, hash: &str) -> ClientResult<()> {
        self.post_form_with_relogin(
            "api/v2/torrents/reannounce",
            &[("hashes", hash.to_string())],
        )
        .await
    }

    /// Client application version (`v5.x.y`).
    ///
    /// # Errors
    ///
    /// Transport or auth failures.
    pub async fn app_version(&self) -> ClientResult<String> {
        let body = self.get_with_relogin("api/v2/app/version", &[]).await?;
        Ok(body.trim().to_string())
    }

    /// Free bytes on the default save-path volume.
    ///
    /// # Errors
    ///
    /// Transport, auth, or decode failures.
    pub async fn free_space(&self) -> ClientResult<u64> {
        let body = self.get_with_relogin("api/v2/sync/maindata", &[]).await?;
        let data: QbitMainData = self.decode("api/v2/sync/maindata", &body)?;
        Ok(data.server_state.free_space_on_disk.max(0) as u64)
    }
}

/// qBittorrent batches hashes with a `|` separator.
fn join_hashes(hashes: &[String]) -> String {
    hashes.join("|")
}

/// qBittorrent expects `-1` for "no limit"; the engine uses any value `<= 0`.
const fn qbit_limit(bps: i64) -> i64 {
    if bps <= 0 { -1 } else { bps }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_join_with_pipe() {
        let hashes = vec!["a".repeat(40), "b".repeat(40)];
        let joined = join_hashes(&hashes);
        assert_eq!(joined.len(), 81);
        assert_eq!(joined.matches('|').count(), 1);
    }

    #[test]
    fn non_positive_limits_map_to_unlimited() {
        assert_eq!(qbit_limit(-1), -1);
        assert_eq!(qbit_limit(0), -1);
        assert_eq!(qbit_limit(-2), -1);
        assert_eq!(qbit_limit(4_096), 4_096);
    }

    #[test]
    fn endpoint_joins_relative_paths() {
        let client = QbitClient::new(1, "http://127.0.0.1:8080/", "admin", "pass").expect("client");
        let url = client.endpoint("api/v2/app/version").expect("join");
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/api/v2/app/version");
    }

    #[test]
    fn bad_url_is_rejected() {
        assert!(QbitClient::new(1, "not a url", "", "").is_err());
    }
}
