use super::*;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub(super) struct ChatSettings {
    pub(super) chat_id: i64,
    pub(super) locale: String,
}

pub(super) struct ChatSettingsStore {
    path: PathBuf,
    records: Mutex<Vec<ChatSettings>>,
}

impl ChatSettingsStore {
    pub(super) fn load(path: PathBuf) -> Result<Self> {
        let records: Vec<ChatSettings> = load_json(&path).context("load chat settings")?;
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub(super) async fn locale(&self, chat_id: i64) -> Option<String> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.chat_id == chat_id)
            .map(|r| r.locale.clone())
    }

    pub(super) async fn set_locale(&self, chat_id: i64, locale: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        match next.iter_mut().find(|r| r.chat_id == chat_id) {
            Some(existing) => existing.locale = locale.to_string(),
            None => next.push(ChatSettings {
                chat_id,
                locale: locale.to_string(),
            }),
        }
        save_json(&self.path, &next).context("save chat settings")?;
        *records = next;
        Ok(())
    }
}
