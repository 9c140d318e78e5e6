//! Command routing and chat turns.
//!
//! The router is transport-free: it takes an [`Incoming`] message, touches
//! the session store, maybe calls the model gateway, and returns a [`Reply`]
//! for the Telegram side to render. Every failure is turned into a reply here.

use std::fmt;
use std::sync::Arc;
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

use crate::relay::catalog::{ModelCatalog, ModelInfo};
use crate::relay::commands::{Command, MenuButton, Route};
use crate::relay::gateway::{GatewayError, ModelGateway};
use crate::relay::markdown;
use crate::relay::session::{Image, InvalidModel, SessionStore, Turn};

/// Prompt used for a photo sent without a caption.
pub const DEFAULT_IMAGE_PROMPT: &str = "What's in this image?";

/// Reply for failures that never reached the router (e.g. a panicking handler).
pub const GENERIC_FAILURE: &str = "⚠️ Something went wrong. Please try again.";

/// Callback data prefix of the model picker buttons.
pub const MODEL_CALLBACK_PREFIX: &str = "model:";

const FEATURES: &str = "Features:
• Text conversation
• Image analysis
• Multiple models
• Independent chat sessions";

const SETTINGS_TEXT: &str = "⚙️ Settings: use /model <name> to switch models";

/// A message as seen by the router.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: String,
    pub text: Option<String>,
    pub image: Option<Image>,
}

/// One outgoing Telegram message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Text is escaped MarkdownV2 rather than plain.
    pub markdown: bool,
}

/// Keyboard attached to the last chunk of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Markup {
    MainMenu,
    ModelPicker { models: Vec<ModelInfo>, current: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub chunks: Vec<Chunk>,
    pub markup: Option<Markup>,
}

impl Reply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            chunks: vec![Chunk {
                text: text.into(),
                markdown: false,
            }],
            markup: None,
        }
    }

    /// `text` must already be valid MarkdownV2.
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            chunks: vec![Chunk {
                text: text.into(),
                markdown: true,
            }],
            markup: None,
        }
    }

    /// Model output as rendered MarkdownV2 chunks.
    pub fn rendered(chunks: Vec<String>) -> Self {
        Self {
            chunks: chunks
                .into_iter()
                .map(|text| Chunk { text, markdown: true })
                .collect(),
            markup: None,
        }
    }

    pub fn with_markup(mut self, markup: Markup) -> Self {
        self.markup = Some(markup);
        self
    }

    /// All chunk texts joined by newlines.
    #[cfg(test)]
    pub fn text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Everything that can go wrong while handling one message.
#[derive(Debug)]
pub enum TurnError {
    InvalidModel(InvalidModel),
    UnknownCommand(String),
    Gateway(GatewayError),
}

impl TurnError {
    /// Text shown to the user in place of a normal reply.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::InvalidModel(e) => format!(
                "❌ Unknown model: {}\nUse /models to see the available models.",
                e.name
            ),
            TurnError::UnknownCommand(token) => format!(
                "❓ Unrecognized command {token}. Send /help for the list of commands."
            ),
            TurnError::Gateway(GatewayError::Quota(_)) => {
                "⚠️ Gemini is over its quota right now. Please try again later.".to_string()
            }
            TurnError::Gateway(GatewayError::Blocked(reason)) => {
                format!("⚠️ Gemini declined to answer this message ({reason}).")
            }
            TurnError::Gateway(_) => {
                "⚠️ Sorry, I couldn't get a response from Gemini. Please try again.".to_string()
            }
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::InvalidModel(e) => write!(f, "{e}"),
            TurnError::UnknownCommand(token) => write!(f, "unknown command {token}"),
            TurnError::Gateway(e) => write!(f, "gateway error: {e}"),
        }
    }
}

impl std::error::Error for TurnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TurnError::InvalidModel(e) => Some(e),
            TurnError::UnknownCommand(_) => None,
            TurnError::Gateway(e) => Some(e),
        }
    }
}

impl From<InvalidModel> for TurnError {
    fn from(e: InvalidModel) -> Self {
        TurnError::InvalidModel(e)
    }
}

impl From<GatewayError> for TurnError {
    fn from(e: GatewayError) -> Self {
        TurnError::Gateway(e)
    }
}

pub struct Router {
    sessions: Arc<SessionStore>,
    catalog: Arc<ModelCatalog>,
    gateway: Arc<dyn ModelGateway>,
    bot_username: String,
}

impl Router {
    pub fn new(
        sessions: Arc<SessionStore>,
        catalog: Arc<ModelCatalog>,
        gateway: Arc<dyn ModelGateway>,
        bot_username: String,
    ) -> Self {
        Self {
            sessions,
            catalog,
            gateway,
            bot_username,
        }
    }

    pub fn bot_username(&self) -> &str {
        &self.bot_username
    }

    #[cfg(test)]
    pub fn route(&self, msg: &Incoming) -> Route {
        crate::relay::commands::classify(msg.text.as_deref(), msg.image.is_some(), &self.bot_username)
    }

    /// Route and answer a message. `None` means nothing should be sent.
    #[cfg(test)]
    pub async fn handle(&self, msg: Incoming) -> Option<Reply> {
        let route = self.route(&msg);
        self.dispatch(route, msg).await
    }

    /// Answer a message whose route is already known.
    pub async fn dispatch(&self, route: Route, msg: Incoming) -> Option<Reply> {
        let chat_id = msg.chat_id;
        let result = match route {
            Route::Ignore => return None,
            Route::Command(command) => self.run_command(chat_id, command).await,
            Route::Menu(button) => self.run_menu(chat_id, button).await,
            Route::Unknown(token) => Err(TurnError::UnknownCommand(token)),
            Route::Chat => self.chat(msg).await,
        };

        Some(result.unwrap_or_else(|e| {
            match &e {
                TurnError::Gateway(inner) => error!("Chat {} turn failed: {}", chat_id, inner),
                _ => info!("Chat {}: {}", chat_id, e),
            }
            Reply::plain(e.user_message())
        }))
    }

    /// Handle an inline button press. Only `model:<id>` is understood.
    pub async fn handle_callback(&self, chat_id: i64, data: &str) -> Option<Reply> {
        let name = data.strip_prefix(MODEL_CALLBACK_PREFIX)?;
        let reply = match self.switch_model(chat_id, name).await {
            Ok(reply) => reply,
            Err(e) => {
                info!("Chat {}: {}", chat_id, e);
                Reply::plain(e.user_message())
            }
        };
        Some(reply)
    }

    async fn run_command(&self, chat_id: i64, command: Command) -> Result<Reply, TurnError> {
        match command {
            Command::Start => Ok(self.start(chat_id).await),
            Command::Help => Ok(help()),
            Command::Models => Ok(self.models(chat_id).await),
            Command::Model(name) if name.is_empty() => Ok(self.models(chat_id).await),
            Command::Model(name) => self.switch_model(chat_id, &name).await,
            Command::New => Ok(self.new_chat(chat_id).await),
        }
    }

    async fn run_menu(&self, chat_id: i64, button: MenuButton) -> Result<Reply, TurnError> {
        match button {
            MenuButton::Models => Ok(self.models(chat_id).await),
            MenuButton::NewChat => Ok(self.new_chat(chat_id).await),
            MenuButton::Help => Ok(help()),
            MenuButton::Settings => Ok(Reply::plain(SETTINGS_TEXT)),
        }
    }

    async fn start(&self, chat_id: i64) -> Reply {
        let model = self.sessions.selected_model(chat_id).await;
        Reply::plain(format!(
            "Gemini Bot Started\n\nCurrent model: {}\n\nUse the menu below or type commands:",
            self.catalog.display_name(&model)
        ))
        .with_markup(Markup::MainMenu)
    }

    async fn models(&self, chat_id: i64) -> Reply {
        let current = self.sessions.selected_model(chat_id).await;
        let models = self.catalog.snapshot();

        let mut text = format!(
            "📋 *Available Models* \\({} found\\)\n\nCurrent: `{}`\n\n",
            models.len(),
            markdown::escape_code(&self.catalog.display_name(&current))
        );
        for model in &models {
            let marker = if model.id == current { "✓ " } else { "" };
            text.push_str(&format!(
                "{}`{}` \\- {}\n",
                marker,
                markdown::escape_code(&model.id),
                markdown::escape_markdown_v2(&model.display_name)
            ));
        }
        text.push_str("\nTap a button or send /model <name> to switch\\.");

        Reply::markdown(text).with_markup(Markup::ModelPicker { models, current })
    }

    async fn switch_model(&self, chat_id: i64, name: &str) -> Result<Reply, TurnError> {
        self.sessions.set_model(chat_id, name).await?;
        Ok(Reply::markdown(format!(
            "✅ Switched to: `{}`\nConversation history is kept; send /new to start fresh\\.",
            markdown::escape_code(&self.catalog.display_name(name))
        )))
    }

    async fn new_chat(&self, chat_id: i64) -> Reply {
        self.sessions.reset(chat_id).await;
        Reply::plain("🧹 Memory cleared")
    }

    /// Send the message to the model with the chat's history. History only
    /// grows when the model answered; a failed turn leaves it untouched.
    async fn chat(&self, msg: Incoming) -> Result<Reply, TurnError> {
        let text = msg
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let turn = match msg.image {
            Some(image) => Turn::user_with_image(text.unwrap_or(DEFAULT_IMAGE_PROMPT), image),
            None => Turn::user(text.unwrap_or_default()),
        };

        let handle = self.sessions.get_or_create(msg.chat_id).await;
        let mut session = handle.lock().await;

        let preview: String = turn.text().chars().take(50).collect();
        info!(
            "💬 {} ({}) in chat {} → {}: \"{}\"",
            msg.username, msg.user_id, msg.chat_id, session.selected_model, preview
        );

        let answer = self
            .gateway
            .generate(&session.selected_model, &session.history, &turn)
            .await?;
        info!("🤖 Gemini responded ({} chars)", answer.len());

        let chunks = markdown::render(&answer);
        if chunks.is_empty() {
            return Err(GatewayError::Empty.into());
        }
        session.history.push(turn);
        session.history.push(Turn::model(answer));

        Ok(Reply::rendered(chunks))
    }
}

fn help() -> Reply {
    Reply::plain(format!(
        "Telegram Gemini Bot\n\n{}\n\n{}",
        Command::descriptions(),
        FEATURES
    ))
}
