use super::*;

pub(super) const MAGNET_PROVIDER: &str = "magnet";
const UID_HASH_LEN: usize = 20;

/// Provenance of a torrent added from a chat.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub(super) struct TorrentMeta {
    pub(super) uid: String,
    pub(super) hash: String,
    pub(super) chat_id: i64,
    pub(super) provider: String,
    pub(super) provider_id: String,
    pub(super) created_at: DateTime<Utc>,
}

pub(super) struct TorrentMetaStore {
    path: PathBuf,
    records: Mutex<Vec<TorrentMeta>>,
}

impl TorrentMetaStore {
    pub(super) fn load(path: PathBuf) -> Result<Self> {
        let records: Vec<TorrentMeta> = load_json(&path).context("load torrent metadata")?;
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Inserts a new record; both uid and hash must be unused.
    pub(super) async fn create(&self, meta: TorrentMeta) -> Result<()> {
        let mut records = self.records.lock().await;
        if records
            .iter()
            .any(|r| r.uid == meta.uid || r.hash == meta.hash)
        {
            bail!("torrent {} is already registered", meta.uid);
        }
        let mut next = records.clone();
        next.push(meta);
        save_json(&self.path, &next).context("save torrent metadata")?;
        *records = next;
        Ok(())
    }

    pub(super) async fn get_by_uid(&self, uid: &str) -> Option<TorrentMeta> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.uid == uid)
            .cloned()
    }

    pub(super) async fn get_by_hash(&self, hash: &str) -> Option<TorrentMeta> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.hash == hash)
            .cloned()
    }

    pub(super) async fn list_by_chat_id(&self, chat_id: i64) -> Vec<TorrentMeta> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub(super) async fn remove_by_uid(&self, uid: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        let next: Vec<TorrentMeta> = records.iter().filter(|r| r.uid != uid).cloned().collect();
        if next.len() == records.len() {
            return Ok(false);
        }
        save_json(&self.path, &next).context("save torrent metadata")?;
        *records = next;
        Ok(true)
    }
}

/// A magnet URI with its BitTorrent v1 info-hash in lowercase hex.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct MagnetLink {
    pub(super) uri: String,
    pub(super) hash: String,
}

impl MagnetLink {
    /// Finds the first magnet URI among the whitespace separated words of `text`.
    pub(super) fn find_in(text: &str) -> Option<Self> {
        text.split_whitespace().find_map(Self::parse)
    }

    pub(super) fn parse(uri: &str) -> Option<Self> {
        let query = uri.strip_prefix("magnet:?")?;
        let hash = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .filter(|(key, _)| key.eq_ignore_ascii_case("xt"))
            .find_map(|(_, value)| {
                let topic = value.get(..9)?;
                if !topic.eq_ignore_ascii_case("urn:btih:") {
                    return None;
                }
                info_hash_to_hex(&value[9..])
            })?;
        Some(Self {
            uri: uri.to_string(),
            hash,
        })
    }

    /// Shortened hash used to name torrents added from a bare magnet.
    pub(super) fn short_hash(&self) -> &str {
        &self.hash[..UID_HASH_LEN]
    }
}

/// Where a torrent came from: a pasted magnet or a search engine result.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct TorrentSource {
    pub(super) provider: String,
    pub(super) provider_id: String,
    pub(super) magnet: MagnetLink,
}

impl TorrentSource {
    pub(super) fn from_magnet(magnet: MagnetLink) -> Self {
        Self {
            provider: MAGNET_PROVIDER.to_string(),
            provider_id: magnet.short_hash().to_string(),
            magnet,
        }
    }

    pub(super) fn from_search(engine: &str, id: &str, magnet: MagnetLink) -> Self {
        Self {
            provider: engine.to_string(),
            provider_id: id.to_string(),
            magnet,
        }
    }

    /// `<provider>_<id>`, the suffix of the `/rm_` and `/ls_` commands.
    pub(super) fn uid(&self) -> String {
        format!("{}_{}", self.provider, self.provider_id)
    }

    pub(super) fn to_meta(&self, chat_id: i64) -> TorrentMeta {
        TorrentMeta {
            uid: self.uid(),
            hash: self.magnet.hash.clone(),
            chat_id,
            provider: self.provider.clone(),
            provider_id: self.provider_id.clone(),
            created_at: Utc::now(),
        }
    }
}

fn info_hash_to_hex(value: &str) -> Option<String> {
    match value.len() {
        40 if value.chars().all(|c| c.is_ascii_hexdigit()) => Some(value.to_ascii_lowercase()),
        32 => base32_to_hex(value),
        _ => None,
    }
}

fn base32_to_hex(value: &str) -> Option<String> {
    let mut out = String::with_capacity(40);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in value.bytes() {
        let digit = match c.to_ascii_uppercase() {
            upper @ b'A'..=b'Z' => upper - b'A',
            digit @ b'2'..=b'7' => digit - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u32::from(digit);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push_str(&format!("{:02x}", (buffer >> bits) & 0xff));
            buffer &= (1 << bits) - 1;
        }
    }
    (out.len() == 40).then_some(out)
}
