use super::*;
use reqwest::StatusCode;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Clone)]
pub(super) struct QBittorrentConfig {
    pub(super) url: String,
    pub(super) username: String,
    pub(super) password: String,
    pub(super) save_path: Option<String>,
    pub(super) delete_files: Option<bool>,
    pub(super) request_timeout_seconds: Option<u64>,
}

/// Live state of one torrent as reported by the download daemon.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct TorrentStatus {
    pub(super) hash: String,
    pub(super) name: String,
    /// Fraction in `0.0..=1.0`.
    pub(super) progress: f64,
    pub(super) seeds: u64,
    pub(super) max_seeds: u64,
    pub(super) peers: u64,
    pub(super) max_peers: u64,
    pub(super) download_speed: u64,
    pub(super) eta_seconds: u64,
    pub(super) size_bytes: u64,
}

impl TorrentStatus {
    pub(super) fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }
}

/// One file inside a torrent.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(super) struct TorrentFile {
    pub(super) name: String,
    #[serde(default)]
    pub(super) size: u64,
    #[serde(default)]
    pub(super) progress: f64,
}

#[async_trait]
pub(super) trait DownloadDaemon: Send + Sync {
    /// Statuses for the given hashes in the daemon's order. Unknown hashes
    /// are simply absent from the result.
    async fn statuses(&self, hashes: &[String]) -> Result<Vec<TorrentStatus>>;

    async fn add_magnet(&self, magnet: &str) -> Result<()>;

    async fn remove(&self, hash: &str) -> Result<()>;

    /// Files of the torrent. Empty while its metadata is still being fetched.
    async fn files(&self, hash: &str) -> Result<Vec<TorrentFile>>;
}

#[derive(Debug, Clone, Deserialize)]
struct QbTorrent {
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    num_seeds: i64,
    #[serde(default)]
    num_complete: i64,
    #[serde(default)]
    num_leechs: i64,
    #[serde(default)]
    num_incomplete: i64,
    #[serde(default)]
    dlspeed: i64,
    #[serde(default)]
    eta: i64,
    #[serde(default)]
    size: i64,
}

impl From<QbTorrent> for TorrentStatus {
    fn from(t: QbTorrent) -> Self {
        // The WebUI reports -1 for counters it does not know yet.
        let count = |value: i64| u64::try_from(value).unwrap_or(0);
        TorrentStatus {
            hash: t.hash.to_ascii_lowercase(),
            name: t.name,
            progress: t.progress.clamp(0.0, 1.0),
            seeds: count(t.num_seeds),
            max_seeds: count(t.num_complete),
            peers: count(t.num_leechs),
            max_peers: count(t.num_incomplete),
            download_speed: count(t.dlspeed),
            eta_seconds: count(t.eta),
            size_bytes: count(t.size),
        }
    }
}

/// Client for the qBittorrent WebUI API (`/api/v2`).
///
/// The session cookie lives in reqwest's cookie store. Login happens lazily
/// on first use and again whenever the daemon rejects the session.
pub(super) struct QBittorrentClient {
    http: reqwest::Client,
    api_base: String,
    username: String,
    password: String,
    save_path: Option<String>,
    delete_files: bool,
    logged_in: Mutex<bool>,
}

impl QBittorrentClient {
    pub(super) fn new(config: &QBittorrentConfig) -> Result<Self> {
        let timeout = config
            .request_timeout_seconds
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(timeout.max(1)))
            .build()
            .context("failed to create qbittorrent client")?;
        Ok(Self {
            http,
            api_base: format!("{}/api/v2", config.url.trim_end_matches('/')),
            username: config.username.clone(),
            password: config.password.clone(),
            save_path: config.save_path.clone(),
            delete_files: config.delete_files.unwrap_or(true),
            logged_in: Mutex::new(false),
        })
    }

    async fn login(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/auth/login", self.api_base))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .context("qbittorrent login request")?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("read qbittorrent login response")?;
        if !status.is_success() || body.trim() != "Ok." {
            bail!("qbittorrent login rejected ({}): {}", status, body.trim());
        }
        debug!("logged in to qbittorrent");
        Ok(())
    }

    async fn ensure_session(&self, force: bool) -> Result<()> {
        let mut logged_in = self.logged_in.lock().await;
        if *logged_in && !force {
            return Ok(());
        }
        *logged_in = false;
        self.login().await?;
        *logged_in = true;
        Ok(())
    }

    pub(super) async fn post_form(&self, endpoint: &str, form: &[(&str, String)]) -> Result<reqwest::Response> {
        self.ensure_session(false).await?;
        let url = format!("{}/{}", self.api_base, endpoint);
        let mut response = self
            .http
            .post(&url)
            .form(form)
            .send()
            .await
            .with_context(|| format!("qbittorrent {} request", endpoint))?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            debug!("qbittorrent session rejected on {}, logging in again", endpoint);
            self.ensure_session(true).await?;
            response = self
                .http
                .post(&url)
                .form(form)
                .send()
                .await
                .with_context(|| format!("qbittorrent {} request", endpoint))?;
        }
        let status = response.status();
        if !status.is_success() {
            bail!("qbittorrent {} failed: {}", endpoint, status);
        }
        Ok(response)
    }
}

#[async_trait]
impl DownloadDaemon for QBittorrentClient {
    async fn statuses(&self, hashes: &[String]) -> Result<Vec<TorrentStatus>> {
        // An empty filter would make the daemon return every torrent it has.
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .post_form("torrents/info", &[("hashes", hashes.join("|"))])
            .await?;
        let torrents: Vec<QbTorrent> = response
            .json()
            .await
            .context("parse qbittorrent torrents/info")?;
        Ok(torrents.into_iter().map(TorrentStatus::from).collect())
    }

    async fn add_magnet(&self, magnet: &str) -> Result<()> {
        let mut form = vec![("urls", magnet.to_string())];
        if let Some(save_path) = &self.save_path {
            form.push(("savepath", save_path.clone()));
        }
        let body = self
            .post_form("torrents/add", &form)
            .await?
            .text()
            .await
            .context("read qbittorrent torrents/add response")?;
        if body.trim() == "Fails." {
            bail!("qbittorrent refused the torrent");
        }
        Ok(())
    }

    async fn remove(&self, hash: &str) -> Result<()> {
        self.post_form(
            "torrents/delete",
            &[
                ("hashes", hash.to_string()),
                ("deleteFiles", self.delete_files.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn files(&self, hash: &str) -> Result<Vec<TorrentFile>> {
        self.post_form("torrents/files", &[("hash", hash.to_string())])
            .await?
            .json()
            .await
            .context("parse qbittorrent torrents/files")
    }
}
