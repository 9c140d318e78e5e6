//! Telegram client using teloxide.

use std::time::Duration;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, FileId, InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton,
    KeyboardMarkup, MessageId, ParseMode, ReplyMarkup,
};
use teloxide::utils::command::BotCommands;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::relay::commands::{Command, MenuButton};
use crate::relay::markdown;
use crate::relay::router::{Chunk, MODEL_CALLBACK_PREFIX, Markup, Reply};
use crate::relay::session::Image;

/// Telegram drops the typing status after ~5 seconds.
const TYPING_INTERVAL: Duration = Duration::from_secs(4);

/// Longest button label before truncation.
const MAX_BUTTON_CHARS: usize = 40;

/// Keeps "typing…" visible until dropped.
pub struct TypingIndicator {
    task: JoinHandle<()>,
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Publish the command menu.
    pub async fn register_commands(&self) -> Result<(), String> {
        self.bot
            .set_my_commands(Command::bot_commands())
            .await
            .map_err(|e| format!("Failed to set commands: {e}"))?;
        info!("Registered {} bot commands", Command::bot_commands().len());
        Ok(())
    }

    /// Send every chunk of `reply`; markup goes on the last one.
    pub async fn send_reply(&self, chat_id: i64, reply: &Reply) -> Result<(), String> {
        let last = reply.chunks.len().saturating_sub(1);
        for (i, chunk) in reply.chunks.iter().enumerate() {
            let markup = if i == last { reply.markup.as_ref() } else { None };
            self.send_chunk(chat_id, chunk, markup).await?;
        }
        Ok(())
    }

    async fn send_chunk(&self, chat_id: i64, chunk: &Chunk, markup: Option<&Markup>) -> Result<(), String> {
        let chat = ChatId(chat_id);

        if chunk.markdown {
            let mut request = self
                .bot
                .send_message(chat, &chunk.text)
                .parse_mode(ParseMode::MarkdownV2);
            if let Some(markup) = markup {
                request = request.reply_markup(reply_markup(markup));
            }
            match request.await {
                Ok(_) => return Ok(()),
                Err(e) => warn!("MarkdownV2 rejected, resending as plain text: {e}"),
            }
        }

        let text = if chunk.markdown {
            markdown::strip_escapes(&chunk.text)
        } else {
            chunk.text.clone()
        };
        let mut request = self.bot.send_message(chat, text);
        if let Some(markup) = markup {
            request = request.reply_markup(reply_markup(markup));
        }
        request.await.map(|_| ()).map_err(|e| {
            let msg = format!("Failed to send: {e}");
            warn!("{}", msg);
            msg
        })
    }

    /// Replace an existing message with the first chunk of `reply`.
    pub async fn edit_reply(&self, chat_id: ChatId, message_id: MessageId, reply: &Reply) -> Result<(), String> {
        let Some(chunk) = reply.chunks.first() else {
            return Ok(());
        };

        if chunk.markdown {
            let result = self
                .bot
                .edit_message_text(chat_id, message_id, &chunk.text)
                .parse_mode(ParseMode::MarkdownV2)
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(e) => warn!("MarkdownV2 edit rejected, retrying as plain text: {e}"),
            }
        }

        let text = if chunk.markdown {
            markdown::strip_escapes(&chunk.text)
        } else {
            chunk.text.clone()
        };
        self.bot
            .edit_message_text(chat_id, message_id, text)
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to edit message: {e}");
                warn!("{}", msg);
                msg
            })
    }

    /// Download a photo by file id. Telegram re-encodes photos as JPEG.
    pub async fn download_photo(&self, file_id: FileId) -> Result<Image, String> {
        let file = self
            .bot
            .get_file(file_id)
            .await
            .map_err(|e| format!("Failed to get file info: {e}"))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| format!("Failed to download file: {e}"))?;

        let mime_type = if file.path.ends_with(".png") {
            "image/png"
        } else if file.path.ends_with(".webp") {
            "image/webp"
        } else {
            "image/jpeg"
        };

        info!("📥 Downloaded photo ({} bytes, {})", data.len(), mime_type);
        Ok(Image {
            data,
            mime_type: mime_type.to_string(),
        })
    }

    /// Show "typing…" in the chat until the returned guard is dropped.
    pub fn start_typing(&self, chat_id: i64) -> TypingIndicator {
        let bot = self.bot.clone();
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = bot.send_chat_action(ChatId(chat_id), ChatAction::Typing).await {
                    warn!("Typing indicator error: {e}");
                    break;
                }
                tokio::time::sleep(TYPING_INTERVAL).await;
            }
        });
        TypingIndicator { task }
    }
}

fn reply_markup(markup: &Markup) -> ReplyMarkup {
    match markup {
        Markup::MainMenu => ReplyMarkup::Keyboard(main_menu()),
        Markup::ModelPicker { models, current } => {
            let rows: Vec<Vec<InlineKeyboardButton>> = models
                .iter()
                .map(|model| {
                    let marker = if &model.id == current { "✓ " } else { "" };
                    let label: String = format!("{}{}", marker, model.display_name)
                        .chars()
                        .take(MAX_BUTTON_CHARS)
                        .collect();
                    vec![InlineKeyboardButton::callback(
                        label,
                        format!("{}{}", MODEL_CALLBACK_PREFIX, model.id),
                    )]
                })
                .collect();
            ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))
        }
    }
}

fn main_menu() -> KeyboardMarkup {
    let rows: Vec<Vec<KeyboardButton>> = MenuButton::ROWS
        .iter()
        .map(|row| row.iter().map(|b| KeyboardButton::new(b.label())).collect())
        .collect();
    KeyboardMarkup::new(rows).resize_keyboard()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::catalog::ModelInfo;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn test_main_menu_layout() {
        let menu = main_menu();
        let labels: Vec<Vec<String>> = menu
            .keyboard
            .iter()
            .map(|row| row.iter().map(|b| b.text.clone()).collect())
            .collect();
        assert_eq!(
            labels,
            vec![
                vec!["📋 Models".to_string(), "🆕 New Chat".to_string()],
                vec!["❓ Help".to_string(), "⚙️ Settings".to_string()],
            ]
        );
    }

    #[test]
    fn test_model_picker_marks_current() {
        let markup = Markup::ModelPicker {
            models: vec![
                ModelInfo::new("gemini-1.5-pro", "Gemini 1.5 Pro"),
                ModelInfo::new("gemini-2.0-flash", "Gemini 2.0 Flash"),
            ],
            current: "gemini-2.0-flash".to_string(),
        };

        let ReplyMarkup::InlineKeyboard(keyboard) = reply_markup(&markup) else {
            panic!("expected inline keyboard");
        };

        assert_eq!(keyboard.inline_keyboard.len(), 2);
        assert_eq!(keyboard.inline_keyboard[0][0].text, "Gemini 1.5 Pro");
        assert_eq!(keyboard.inline_keyboard[1][0].text, "✓ Gemini 2.0 Flash");
        assert!(matches!(
            &keyboard.inline_keyboard[1][0].kind,
            InlineKeyboardButtonKind::CallbackData(data) if data == "model:gemini-2.0-flash"
        ));
    }
}
