use super::*;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};

const PROGRESS_KIND: MessageKind = MessageKind::TorrentProgress;

#[derive(Clone, Debug)]
pub(super) struct EngineOptions {
    pub(super) default_locale: String,
    /// How long a persisted progress row stays valid after its last write.
    pub(super) state_ttl: Duration,
    /// Pause before retrying an edit that reported "message not found".
    pub(super) edit_retry_delay: Duration,
}

/// JSON payload stored in the `data` column of a progress row.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub(super) struct ProgressPayload {
    #[serde(default)]
    pub(super) uids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct MessageHandle {
    pub(super) id: i32,
    /// Body of the last successful send or edit. `None` after a restart.
    pub(super) text: Option<String>,
    pub(super) expires_at: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(super) struct RecoveryReport {
    pub(super) purged: usize,
    pub(super) restored: usize,
    pub(super) skipped: usize,
}

enum EditOutcome {
    Updated,
    /// The old message was gone; a fresh one was sent with this id.
    Recreated(i32),
    /// The old message was gone and re-sending failed too.
    Lost,
    Failed,
}

/// Keeps one live progress message per chat in sync with the download daemon.
///
/// All message and state mutations for a chat happen under that chat's lock.
/// Concurrent `reconcile` calls for the same chat share a single run.
pub(super) struct ProgressEngine {
    messenger: Arc<dyn Messenger>,
    daemon: Arc<dyn DownloadDaemon>,
    metas: Arc<TorrentMetaStore>,
    states: Arc<MessageStateStore>,
    settings: Arc<ChatSettingsStore>,
    translator: Arc<dyn Translator>,
    options: EngineOptions,
    locks: ChatLocks,
    handles: Mutex<HashMap<i64, MessageHandle>>,
    tracked: Mutex<HashMap<i64, BTreeSet<String>>>,
    inflight: Mutex<HashMap<i64, Shared<BoxFuture<'static, ()>>>>,
}

impl ProgressEngine {
    pub(super) fn new(
        messenger: Arc<dyn Messenger>,
        daemon: Arc<dyn DownloadDaemon>,
        metas: Arc<TorrentMetaStore>,
        states: Arc<MessageStateStore>,
        settings: Arc<ChatSettingsStore>,
        translator: Arc<dyn Translator>,
        options: EngineOptions,
    ) -> Self {
        Self {
            messenger,
            daemon,
            metas,
            states,
            settings,
            translator,
            options,
            locks: ChatLocks::new(),
            handles: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds the in-memory caches from the message-state store.
    ///
    /// Must finish before the periodic driver starts.
    pub(super) async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let now = now_ts();
        match self.states.delete_expired_before(now).await {
            Ok(purged) => report.purged = purged,
            Err(err) => error!("failed to purge expired message state: {:#}", err),
        }

        let mut handles = self.handles.lock().await;
        let mut tracked = self.tracked.lock().await;
        for record in self.states.list_all_of_kind(PROGRESS_KIND).await {
            // Rows the purge could not remove are still abandoned.
            if record.expires_at <= now {
                continue;
            }
            let payload: ProgressPayload = match serde_json::from_value(record.data.clone()) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(
                        "skipping progress state for chat {}: bad payload: {}",
                        record.chat_id, err
                    );
                    report.skipped += 1;
                    continue;
                }
            };
            if let Some(id) = record.message_id {
                handles.insert(
                    record.chat_id,
                    MessageHandle {
                        id,
                        text: None,
                        expires_at: record.expires_at,
                    },
                );
            }
            tracked.insert(record.chat_id, payload.uids.into_iter().collect());
            report.restored += 1;
        }
        report
    }

    /// Starts tracking `uid` in `chat_id` and persists the new set.
    pub(super) async fn track(&self, chat_id: i64, uid: &str) {
        self.locks
            .with_chat_lock(chat_id, async {
                let uids = {
                    let mut tracked = self.tracked.lock().await;
                    let set = tracked.entry(chat_id).or_default();
                    set.insert(uid.to_string());
                    set.clone()
                };
                self.persist_current(chat_id, &uids).await;
            })
            .await
    }

    pub(super) async fn untrack(&self, chat_id: i64, uid: &str) {
        self.locks
            .with_chat_lock(chat_id, async {
                let uids = {
                    let mut tracked = self.tracked.lock().await;
                    match tracked.get_mut(&chat_id) {
                        Some(set) => {
                            set.remove(uid);
                            set.clone()
                        }
                        None => return,
                    }
                };
                self.persist_current(chat_id, &uids).await;
            })
            .await
    }

    /// Brings the chat's progress message up to date.
    ///
    /// If a run for this chat is already in flight the caller waits for it
    /// instead of starting another one, even when `force` is set.
    pub(super) async fn reconcile(self: &Arc<Self>, chat_id: i64, force: bool) {
        let run = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&chat_id) {
                Some(run) => {
                    debug!("joining in-flight reconcile for chat {}", chat_id);
                    run.clone()
                }
                None => {
                    let engine = Arc::clone(self);
                    let run = async move {
                        engine
                            .locks
                            .with_chat_lock(chat_id, engine.reconcile_locked(chat_id, force))
                            .await;
                        engine.inflight.lock().await.remove(&chat_id);
                    }
                    .boxed()
                    .shared();
                    inflight.insert(chat_id, run.clone());
                    run
                }
            }
        };
        run.await
    }

    /// Waits for every reconcile run that is currently in flight.
    pub(super) async fn drain(&self) {
        let runs: Vec<_> = self.inflight.lock().await.values().cloned().collect();
        if !runs.is_empty() {
            info!("waiting for {} in-flight progress updates", runs.len());
        }
        join_all(runs).await;
    }

    /// Chats that have a live message or tracked items.
    pub(super) async fn active_chats(&self) -> Vec<i64> {
        let mut chats: BTreeSet<i64> = self.handles.lock().await.keys().copied().collect();
        chats.extend(self.tracked.lock().await.keys().copied());
        chats.into_iter().collect()
    }

    #[cfg(test)]
    pub(super) async fn handle(&self, chat_id: i64) -> Option<MessageHandle> {
        self.handles.lock().await.get(&chat_id).cloned()
    }

    #[cfg(test)]
    pub(super) async fn tracked_uids(&self, chat_id: i64) -> Option<BTreeSet<String>> {
        self.tracked.lock().await.get(&chat_id).cloned()
    }

    #[cfg(test)]
    pub(super) fn lock_slots(&self) -> usize {
        self.locks.active_slots()
    }

    async fn reconcile_locked(&self, chat_id: i64, force: bool) {
        let tracked = self
            .tracked
            .lock()
            .await
            .get(&chat_id)
            .cloned()
            .unwrap_or_default();
        let items = self.tracked_items(chat_id, &tracked).await;
        if items.is_empty() {
            self.clear_chat(chat_id).await;
            return;
        }

        let hashes: Vec<String> = items.iter().map(|meta| meta.hash.clone()).collect();
        let statuses = match self.daemon.statuses(&hashes).await {
            Ok(statuses) => statuses,
            Err(err) => {
                warn!("status fetch for chat {} failed: {:#}", chat_id, err);
                return;
            }
        };

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let mut completed = Vec::new();
        for status in statuses {
            let Some(meta) = items.iter().find(|meta| meta.hash == status.hash) else {
                continue;
            };
            if !seen.insert(meta.uid.clone()) {
                continue;
            }
            if status.is_complete() {
                completed.push((meta.uid.clone(), status));
            } else {
                pending.push((meta.uid.clone(), status));
            }
        }
        if seen.len() < items.len() {
            debug!(
                "chat {}: {} tracked torrents have no daemon status",
                chat_id,
                items.len() - seen.len()
            );
        }

        let locale = self.locale(chat_id).await;
        if pending.is_empty() {
            self.clear_chat(chat_id).await;
        } else {
            self.update_progress(chat_id, force, &tracked, &pending, &locale)
                .await;
        }

        // Completion notices go out after the progress message is settled.
        for (uid, status) in &completed {
            let text = render_completed_item(self.translator.as_ref(), &locale, uid, status);
            match self.messenger.send_message(chat_id, &text).await {
                Ok(_) => info!("chat {}: {} finished downloading", chat_id, uid),
                Err(err) => warn!("chat {}: completion notice for {} failed: {}", chat_id, uid, err),
            }
        }
    }

    /// Sends or edits the progress message for a non-empty pending set.
    async fn update_progress(
        &self,
        chat_id: i64,
        force: bool,
        tracked: &BTreeSet<String>,
        pending: &[(String, TorrentStatus)],
        locale: &str,
    ) {
        let uids: BTreeSet<String> = pending.iter().map(|(uid, _)| uid.clone()).collect();
        let tracked_changed = &uids != tracked;
        self.tracked.lock().await.insert(chat_id, uids.clone());

        let body = render_progress_body(self.translator.as_ref(), locale, pending);

        let current = self.handles.lock().await.get(&chat_id).cloned();
        let needs_persist = match current {
            Some(handle) if !force && handle.text.as_deref() == Some(body.as_str()) => {
                tracked_changed || self.expiry_is_near(handle.expires_at)
            }
            Some(handle) => {
                let outcome = self.edit_progress(chat_id, handle.id, &body).await;
                match outcome {
                    EditOutcome::Updated => {
                        self.set_handle(chat_id, handle.id, body, handle.expires_at)
                            .await;
                        true
                    }
                    EditOutcome::Recreated(id) => {
                        self.set_handle(chat_id, id, body, 0).await;
                        true
                    }
                    EditOutcome::Lost => {
                        self.handles.lock().await.remove(&chat_id);
                        true
                    }
                    EditOutcome::Failed => tracked_changed,
                }
            }
            None => {
                let sent = self.messenger.send_message(chat_id, &body).await;
                match sent {
                    Ok(id) => {
                        debug!("chat {}: sent progress message {}", chat_id, id);
                        self.set_handle(chat_id, id, body, 0).await;
                        true
                    }
                    Err(err) => {
                        warn!("chat {}: sending progress message failed: {}", chat_id, err);
                        tracked_changed
                    }
                }
            }
        };

        if needs_persist {
            self.persist_current(chat_id, &uids).await;
        }
    }

    /// Metadata of the chat's tracked torrents, one entry per uid.
    async fn tracked_items(&self, chat_id: i64, tracked: &BTreeSet<String>) -> Vec<TorrentMeta> {
        if tracked.is_empty() {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        self.metas
            .list_by_chat_id(chat_id)
            .await
            .into_iter()
            .filter(|meta| tracked.contains(&meta.uid))
            .filter(|meta| seen.insert(meta.uid.clone()))
            .collect()
    }

    /// Terminal state: no live message and no row.
    async fn clear_chat(&self, chat_id: i64) {
        self.tracked.lock().await.remove(&chat_id);
        let handle = self.handles.lock().await.get(&chat_id).cloned();
        if let Some(handle) = handle {
            if !self.delete_progress(chat_id, handle.id).await {
                // Keep the handle so the next run retries the delete.
                self.persist_current(chat_id, &BTreeSet::new()).await;
                return;
            }
            self.handles.lock().await.remove(&chat_id);
            debug!("chat {}: removed progress message {}", chat_id, handle.id);
        }
        if let Err(err) = self.states.delete(chat_id, PROGRESS_KIND).await {
            warn!("chat {}: failed to delete progress state: {:#}", chat_id, err);
        }
    }

    async fn edit_progress(&self, chat_id: i64, message_id: i32, body: &str) -> EditOutcome {
        match self.messenger.edit_message(chat_id, message_id, body).await {
            Ok(()) => return EditOutcome::Updated,
            Err(PlatformError::NotFound) => {}
            Err(err) => {
                warn!("chat {}: editing message {} failed: {}", chat_id, message_id, err);
                return EditOutcome::Failed;
            }
        }

        tokio::time::sleep(self.options.edit_retry_delay).await;
        match self.messenger.edit_message(chat_id, message_id, body).await {
            Ok(()) => EditOutcome::Updated,
            Err(PlatformError::NotFound) => {
                info!(
                    "chat {}: progress message {} is gone, sending a new one",
                    chat_id, message_id
                );
                match self.messenger.send_message(chat_id, body).await {
                    Ok(id) => EditOutcome::Recreated(id),
                    Err(err) => {
                        warn!("chat {}: re-sending progress message failed: {}", chat_id, err);
                        EditOutcome::Lost
                    }
                }
            }
            Err(err) => {
                warn!("chat {}: editing message {} failed: {}", chat_id, message_id, err);
                EditOutcome::Failed
            }
        }
    }

    /// Returns false only when the message may still be visible.
    async fn delete_progress(&self, chat_id: i64, message_id: i32) -> bool {
        match self.messenger.delete_message(chat_id, message_id).await {
            Ok(()) | Err(PlatformError::NotFound) => true,
            Err(err) => {
                warn!("chat {}: deleting message {} failed: {}", chat_id, message_id, err);
                false
            }
        }
    }

    async fn set_handle(&self, chat_id: i64, id: i32, text: String, expires_at: u64) {
        self.handles.lock().await.insert(
            chat_id,
            MessageHandle {
                id,
                text: Some(text),
                expires_at,
            },
        );
    }

    /// Writes the cached handle id and `uids` to the store. Failures are
    /// logged and otherwise ignored; the caches stay authoritative.
    async fn persist_current(&self, chat_id: i64, uids: &BTreeSet<String>) {
        let message_id = self.handles.lock().await.get(&chat_id).map(|h| h.id);
        if message_id.is_none() && uids.is_empty() {
            if let Err(err) = self.states.delete(chat_id, PROGRESS_KIND).await {
                warn!("chat {}: failed to delete progress state: {:#}", chat_id, err);
            }
            return;
        }

        let payload = ProgressPayload {
            uids: uids.iter().cloned().collect(),
        };
        let data = match serde_json::to_value(&payload) {
            Ok(data) => data,
            Err(err) => {
                warn!("chat {}: failed to encode progress state: {}", chat_id, err);
                return;
            }
        };
        let expires_at = now_ts() + self.options.state_ttl.as_secs();
        match self
            .states
            .upsert(chat_id, PROGRESS_KIND, message_id, data, expires_at)
            .await
        {
            Ok(_) => {
                if let Some(handle) = self.handles.lock().await.get_mut(&chat_id) {
                    handle.expires_at = expires_at;
                }
            }
            Err(err) => warn!("chat {}: failed to persist progress state: {:#}", chat_id, err),
        }
    }

    fn expiry_is_near(&self, expires_at: u64) -> bool {
        expires_at.saturating_sub(now_ts()) < self.options.state_ttl.as_secs() / 2
    }

    async fn locale(&self, chat_id: i64) -> String {
        self.settings
            .locale(chat_id)
            .await
            .unwrap_or_else(|| self.options.default_locale.clone())
    }
}
