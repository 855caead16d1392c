use super::*;
use teloxide::types::MessageId;
use teloxide::{ApiError, RequestError};

#[derive(Debug, thiserror::Error)]
pub(super) enum PlatformError {
    /// The target message no longer exists (deleted by a user, or too old).
    #[error("message not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The three message operations the progress engine needs from a chat platform.
#[async_trait]
pub(super) trait Messenger: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i32, PlatformError>;

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
    ) -> Result<(), PlatformError>;

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<(), PlatformError>;
}

pub(super) struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub(super) fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i32, PlatformError> {
        let sent = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await
            .map_err(|e| PlatformError::Other(e.into()))?;
        Ok(sent.id.0)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
    ) -> Result<(), PlatformError> {
        let result = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await;
        match result {
            Ok(_) => Ok(()),
            // Same text as before: the message already shows what we want.
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(RequestError::Api(ApiError::MessageToEditNotFound)) => Err(PlatformError::NotFound),
            Err(err) => Err(PlatformError::Other(err.into())),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<(), PlatformError> {
        match self
            .bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await
        {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageToDeleteNotFound)) => {
                Err(PlatformError::NotFound)
            }
            Err(err) => Err(PlatformError::Other(err.into())),
        }
    }
}
