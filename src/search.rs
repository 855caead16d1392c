use super::*;
use futures::future::join_all;
use tokio::time::Instant;

/// Name of the engine backed by qBittorrent's search plugins.
pub(super) const QB_SEARCH_ENGINE: &str = "qbt";
const SEARCH_RESULTS_SHOWN: usize = 5;
const SEARCH_TITLE_CHARS: usize = 200;
const QB_RESULTS_FETCHED: usize = 50;
const QB_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 15;
const MAX_REMEMBERED_RESULTS: usize = 1000;

#[derive(Debug, Deserialize, Clone, Default)]
pub(super) struct SearchConfig {
    pub(super) enabled: Option<bool>,
    /// Plugin selector passed to qBittorrent, `enabled` by default.
    pub(super) plugins: Option<String>,
    pub(super) timeout_seconds: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct SearchResult {
    /// Engine-local id, the last part of the `/dl_<engine>_<id>` command.
    pub(super) id: String,
    pub(super) title: String,
    pub(super) size_bytes: u64,
    pub(super) seeds: u64,
    pub(super) peers: u64,
    pub(super) published: Option<DateTime<Utc>>,
    pub(super) details_url: Option<String>,
}

/// A torrent index that can be queried from chat.
///
/// Engine names must not contain `_`, it separates name and id in the
/// download command.
#[async_trait]
pub(super) trait SearchEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;

    /// Resolves a result id from an earlier search to a magnet URI.
    async fn download(&self, id: &str) -> Result<String>;
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct SearchHit {
    pub(super) engine: String,
    pub(super) result: SearchResult,
}

/// Queries every engine concurrently and keeps the best seeded results.
/// Fails only when every engine failed.
pub(super) async fn search_all(
    engines: &[Arc<dyn SearchEngine>],
    query: &str,
) -> Result<Vec<SearchHit>> {
    let outcomes = join_all(engines.iter().map(|engine| async move {
        let found = engine.search(query).await;
        (engine.name().to_string(), found)
    }))
    .await;

    let mut hits = Vec::new();
    let mut last_err = None;
    let mut answered = false;
    for (engine, found) in outcomes {
        match found {
            Ok(results) => {
                answered = true;
                hits.extend(results.into_iter().map(|result| SearchHit {
                    engine: engine.clone(),
                    result,
                }));
            }
            Err(err) => {
                warn!("search engine {} failed: {:#}", engine, err);
                last_err = Some(err);
            }
        }
    }
    if let (false, Some(err)) = (answered, last_err) {
        return Err(err.context("every search engine failed"));
    }

    hits.sort_by(|a, b| b.result.seeds.cmp(&a.result.seeds));
    hits.truncate(SEARCH_RESULTS_SHOWN);
    Ok(hits)
}

pub(super) fn render_search_results(
    translator: &dyn Translator,
    locale: &str,
    hits: &[SearchHit],
) -> String {
    hits.iter()
        .map(|hit| {
            let result = &hit.result;
            let source = match &result.details_url {
                Some(url) => format!(
                    "<a href=\"{}\">[{}]</a>",
                    escape_html(url),
                    escape_html(&hit.engine)
                ),
                None => format!("[{}]", escape_html(&hit.engine)),
            };
            let published = result
                .published
                .map(|at| at.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "---".to_string());
            translator.translate(
                "search-item",
                locale,
                &[
                    ("title", escape_html(&truncate_chars(&result.title, SEARCH_TITLE_CHARS))),
                    ("source", source),
                    ("size", format_bytes(result.size_bytes)),
                    ("seeds", result.seeds.to_string()),
                    ("peers", result.peers.to_string()),
                    ("published", published),
                    ("download", download_command(&hit.engine, &result.id)),
                ],
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Deserialize)]
struct QbSearchJob {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct QbSearchStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct QbSearchPage {
    #[serde(default)]
    results: Vec<QbSearchResult>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct QbSearchResult {
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    file_url: String,
    #[serde(default)]
    file_size: i64,
    #[serde(default)]
    nb_seeders: i64,
    #[serde(default)]
    nb_leechers: i64,
    #[serde(default)]
    descr_link: String,
    #[serde(default)]
    pub_date: i64,
}

impl QbSearchResult {
    /// Only magnet results can be added later without fetching a file.
    pub(super) fn into_magnet_result(self) -> Option<(SearchResult, MagnetLink)> {
        let magnet = MagnetLink::parse(&self.file_url)?;
        let count = |value: i64| u64::try_from(value).unwrap_or(0);
        let result = SearchResult {
            id: magnet.short_hash().to_string(),
            title: self.file_name,
            size_bytes: count(self.file_size),
            seeds: count(self.nb_seeders),
            peers: count(self.nb_leechers),
            published: (self.pub_date > 0)
                .then(|| DateTime::<Utc>::from_timestamp(self.pub_date, 0))
                .flatten(),
            details_url: Some(self.descr_link).filter(|link| link.starts_with("http")),
        };
        Some((result, magnet))
    }
}

/// Searches through the plugins installed in qBittorrent.
///
/// Found magnets are remembered in memory so `/dl_` can add them with their
/// trackers. After a restart the user has to search again.
pub(super) struct QbSearchEngine {
    client: Arc<QBittorrentClient>,
    plugins: String,
    timeout: Duration,
    found: Mutex<HashMap<String, MagnetLink>>,
}

impl QbSearchEngine {
    pub(super) fn new(client: Arc<QBittorrentClient>, config: &SearchConfig) -> Self {
        Self {
            client,
            plugins: config
                .plugins
                .clone()
                .unwrap_or_else(|| "enabled".to_string()),
            timeout: Duration::from_secs(
                config.timeout_seconds.unwrap_or(DEFAULT_SEARCH_TIMEOUT_SECS),
            ),
            found: Mutex::new(HashMap::new()),
        }
    }

    async fn collect(&self, job: i64) -> Result<Vec<QbSearchResult>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let statuses: Vec<QbSearchStatus> = self
                .client
                .post_form("search/status", &[("id", job.to_string())])
                .await?
                .json()
                .await
                .context("parse qbittorrent search/status")?;
            let running = statuses.iter().any(|s| s.status == "Running");
            if !running || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(QB_POLL_INTERVAL).await;
        }
        let page: QbSearchPage = self
            .client
            .post_form(
                "search/results",
                &[
                    ("id", job.to_string()),
                    ("limit", QB_RESULTS_FETCHED.to_string()),
                ],
            )
            .await?
            .json()
            .await
            .context("parse qbittorrent search/results")?;
        Ok(page.results)
    }
}

#[async_trait]
impl SearchEngine for QbSearchEngine {
    fn name(&self) -> &str {
        QB_SEARCH_ENGINE
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let job: QbSearchJob = self
            .client
            .post_form(
                "search/start",
                &[
                    ("pattern", query.to_string()),
                    ("plugins", self.plugins.clone()),
                    ("category", "all".to_string()),
                ],
            )
            .await?
            .json()
            .await
            .context("parse qbittorrent search/start")?;
        let collected = self.collect(job.id).await;
        if let Err(err) = self
            .client
            .post_form("search/delete", &[("id", job.id.to_string())])
            .await
        {
            debug!("deleting search job {} failed: {:#}", job.id, err);
        }

        let mut results = Vec::new();
        let mut found = self.found.lock().await;
        if found.len() > MAX_REMEMBERED_RESULTS {
            found.clear();
        }
        for (result, magnet) in collected?
            .into_iter()
            .filter_map(QbSearchResult::into_magnet_result)
        {
            // Several plugins often index the same torrent.
            if results.iter().any(|r: &SearchResult| r.id == result.id) {
                continue;
            }
            found.insert(result.id.clone(), magnet);
            results.push(result);
        }
        debug!("search {:?} found {} magnet results", query, results.len());
        Ok(results)
    }

    async fn download(&self, id: &str) -> Result<String> {
        match self.found.lock().await.get(id) {
            Some(magnet) => Ok(magnet.uri.clone()),
            None => bail!("search result {} is not known, search again", id),
        }
    }
}
