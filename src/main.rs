use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use tokio::sync::Mutex;

mod chat_lock;
mod chat_settings;
mod format;
mod handlers;
mod locales;
mod message_state;
mod messenger;
mod progress;
mod qbittorrent;
mod scheduler;
mod search;
mod torrent_meta;


use chat_lock::*;
use chat_settings::*;
use format::*;
use handlers::*;
use locales::*;
use message_state::*;
use messenger::*;
use progress::*;
use qbittorrent::*;
use scheduler::*;
use search::*;
use torrent_meta::*;

const DEFAULT_LOCALE: &str = "en";
const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 5;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_MESSAGE_STATE_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_EDIT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Deserialize, Clone)]
struct Config {
    token: String,
    #[serde(default)]
    allowed_user_ids: Vec<u64>,
    data_dir: PathBuf,
    default_locale: Option<String>,
    progress_interval_seconds: Option<u64>,
    cleanup_interval_seconds: Option<u64>,
    message_state_ttl_seconds: Option<u64>,
    edit_retry_delay_ms: Option<u64>,
    qbittorrent: QBittorrentConfig,
    #[serde(default)]
    search: SearchConfig,
}

impl Config {
    fn default_locale(&self) -> String {
        self.default_locale
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            default_locale: self.default_locale(),
            state_ttl: Duration::from_secs(
                self.message_state_ttl_seconds
                    .unwrap_or(DEFAULT_MESSAGE_STATE_TTL_SECS),
            ),
            edit_retry_delay: Duration::from_millis(
                self.edit_retry_delay_ms.unwrap_or(DEFAULT_EDIT_RETRY_DELAY_MS),
            ),
        }
    }
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    config: PathBuf,
}

struct AppState {
    config: Config,
    translator: Arc<dyn Translator>,
    settings: Arc<ChatSettingsStore>,
    metas: Arc<TorrentMetaStore>,
    daemon: Arc<dyn DownloadDaemon>,
    search_engines: Vec<Arc<dyn SearchEngine>>,
    engine: Arc<ProgressEngine>,
}

impl AppState {
    fn is_allowed(&self, user_id: u64) -> bool {
        self.config.allowed_user_ids.is_empty() || self.config.allowed_user_ids.contains(&user_id)
    }

    async fn locale(&self, chat_id: i64) -> String {
        self.settings
            .locale(chat_id)
            .await
            .unwrap_or_else(|| self.config.default_locale())
    }

    fn t(&self, locale: &str, key: &str, params: &[(&str, String)]) -> String {
        self.translator.translate(key, locale, params)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    fs::create_dir_all(&config.data_dir).context("create data_dir")?;

    let translator: Arc<dyn Translator> = Arc::new(Locales);
    let settings = Arc::new(ChatSettingsStore::load(
        config.data_dir.join("chat_settings.json"),
    )?);
    let metas = Arc::new(TorrentMetaStore::load(config.data_dir.join("torrents.json"))?);
    let states = Arc::new(MessageStateStore::load(
        config.data_dir.join("message_state.json"),
    )?);
    let qbittorrent = Arc::new(QBittorrentClient::new(&config.qbittorrent)?);
    let daemon: Arc<dyn DownloadDaemon> = qbittorrent.clone();
    let mut search_engines: Vec<Arc<dyn SearchEngine>> = Vec::new();
    if config.search.enabled.unwrap_or(true) {
        search_engines.push(Arc::new(QbSearchEngine::new(qbittorrent, &config.search)));
    }

    let bot = Bot::new(config.token.clone());
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(bot.clone()));

    let engine = Arc::new(ProgressEngine::new(
        messenger,
        daemon.clone(),
        metas.clone(),
        states.clone(),
        settings.clone(),
        translator.clone(),
        config.engine_options(),
    ));

    let report = engine.recover().await;
    info!(
        "recovered progress state: {} restored, {} expired purged, {} skipped",
        report.restored, report.purged, report.skipped
    );

    let progress_secs = config
        .progress_interval_seconds
        .unwrap_or(DEFAULT_PROGRESS_INTERVAL_SECS);
    let progress_job = start_progress_loop(engine.clone(), Duration::from_secs(progress_secs));
    let cleanup_secs = config
        .cleanup_interval_seconds
        .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS);
    let cleanup_job = start_cleanup_loop(states, Duration::from_secs(cleanup_secs));

    let state = Arc::new(AppState {
        config,
        translator,
        settings,
        metas,
        daemon,
        search_engines,
        engine: engine.clone(),
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    info!("bot is running");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("shutting down, waiting for in-flight progress updates");
    progress_job.stop().await;
    cleanup_job.stop().await;
    engine.drain().await;

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config: Config = toml::from_str(&contents).context("parse config")?;
    Ok(config)
}

fn load_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))
}

fn save_json<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    atomic_write(path, &data)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(data).context("write temp file")?;
    tmp.flush().context("flush temp file")?;
    tmp.as_file_mut().sync_all().context("sync temp file")?;
    tmp.persist(path)
        .map_err(|e| anyhow!("persist temp file: {}", e))?;
    Ok(())
}

fn parse_command(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    let cmd = first.trim_start_matches('/');
    Some(cmd.split('@').next().unwrap_or(cmd))
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
