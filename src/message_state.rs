use super::*;
use serde_json::Value;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub(super) enum MessageKind {
    TorrentProgress,
}

/// Last known outbound message of one kind in one chat.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub(super) struct MessageStateRecord {
    pub(super) chat_id: i64,
    pub(super) kind: MessageKind,
    #[serde(default)]
    pub(super) message_id: Option<i32>,
    #[serde(default)]
    pub(super) data: Value,
    pub(super) expires_at: u64,
    pub(super) created_at: u64,
    pub(super) updated_at: u64,
}

/// JSON-file store with at most one record per `(chat_id, kind)`.
///
/// Every mutation rewrites the file atomically; the in-memory copy only
/// changes once the write has succeeded.
pub(super) struct MessageStateStore {
    path: PathBuf,
    records: Mutex<Vec<MessageStateRecord>>,
}

impl MessageStateStore {
    pub(super) fn load(path: PathBuf) -> Result<Self> {
        let records: Vec<MessageStateRecord> =
            load_json(&path).context("load message state")?;
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub(super) async fn upsert(
        &self,
        chat_id: i64,
        kind: MessageKind,
        message_id: Option<i32>,
        data: Value,
        expires_at: u64,
    ) -> Result<MessageStateRecord> {
        let mut records = self.records.lock().await;
        let now = now_ts();
        let mut next = records.clone();
        let record = match next
            .iter_mut()
            .find(|r| r.chat_id == chat_id && r.kind == kind)
        {
            Some(existing) => {
                existing.message_id = message_id;
                existing.data = data;
                existing.expires_at = expires_at;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = MessageStateRecord {
                    chat_id,
                    kind,
                    message_id,
                    data,
                    expires_at,
                    created_at: now,
                    updated_at: now,
                };
                next.push(record.clone());
                record
            }
        };
        save_json(&self.path, &next).context("save message state")?;
        *records = next;
        Ok(record)
    }

    #[cfg(test)]
    pub(super) async fn get(&self, chat_id: i64, kind: MessageKind) -> Option<MessageStateRecord> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.chat_id == chat_id && r.kind == kind)
            .cloned()
    }

    pub(super) async fn delete(&self, chat_id: i64, kind: MessageKind) -> Result<bool> {
        self.remove_where(|r| r.chat_id == chat_id && r.kind == kind)
            .await
            .map(|removed| removed > 0)
    }

    pub(super) async fn list_all_of_kind(&self, kind: MessageKind) -> Vec<MessageStateRecord> {
        let mut records: Vec<MessageStateRecord> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.chat_id);
        records
    }

    /// Removes every record whose expiry is at or before `cutoff`.
    pub(super) async fn delete_expired_before(&self, cutoff: u64) -> Result<usize> {
        self.remove_where(|r| r.expires_at <= cutoff).await
    }

    async fn remove_where<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&MessageStateRecord) -> bool,
    {
        let mut records = self.records.lock().await;
        let next: Vec<MessageStateRecord> =
            records.iter().filter(|r| !predicate(r)).cloned().collect();
        let removed = records.len() - next.len();
        if removed == 0 {
            return Ok(0);
        }
        save_json(&self.path, &next).context("save message state")?;
        *records = next;
        Ok(removed)
    }
}
