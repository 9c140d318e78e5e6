//! Command surface and per-message routing decision.

use teloxide::utils::command::{BotCommands, ParseError};
use tracing::debug;

/// Slash commands understood by the bot. Declaration order is the order shown
/// in Telegram's command menu.
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Commands:")]
pub enum Command {
    #[command(description = "Start the bot")]
    Start,
    #[command(description = "Show help")]
    Help,
    #[command(description = "View and switch models")]
    Models,
    #[command(description = "Switch model by name", parse_with = parse_model_arg)]
    Model(String),
    #[command(description = "Clear conversation")]
    New,
}

/// `/model` takes an optional name; an empty string means none was given.
fn parse_model_arg(input: String) -> Result<(String,), ParseError> {
    Ok((input.trim().to_string(),))
}

/// Buttons of the persistent reply keyboard shown after `/start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuButton {
    Models,
    NewChat,
    Help,
    Settings,
}

impl MenuButton {
    /// Keyboard layout, row by row.
    pub const ROWS: [[MenuButton; 2]; 2] = [
        [MenuButton::Models, MenuButton::NewChat],
        [MenuButton::Help, MenuButton::Settings],
    ];

    pub fn label(self) -> &'static str {
        match self {
            MenuButton::Models => "📋 Models",
            MenuButton::NewChat => "🆕 New Chat",
            MenuButton::Help => "❓ Help",
            MenuButton::Settings => "⚙️ Settings",
        }
    }

    pub fn from_label(text: &str) -> Option<Self> {
        Self::ROWS
            .iter()
            .flatten()
            .copied()
            .find(|button| button.label() == text)
    }
}

/// What to do with an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Command(Command),
    Menu(MenuButton),
    /// Slash-prefixed text that is not one of our commands.
    Unknown(String),
    /// Nothing to answer (empty message, command for another bot).
    Ignore,
    /// Free-form input for the model.
    Chat,
}

/// Decide the route for a message. Anything carrying an image is chat input,
/// with its caption used as the prompt even if it looks like a command.
pub fn classify(text: Option<&str>, has_image: bool, bot_username: &str) -> Route {
    if has_image {
        return Route::Chat;
    }

    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Route::Ignore;
    };

    if let Some(button) = MenuButton::from_label(text) {
        return Route::Menu(button);
    }

    if !text.starts_with('/') {
        return Route::Chat;
    }

    match Command::parse(text, bot_username) {
        Ok(command) => Route::Command(command),
        Err(ParseError::WrongBotName(name)) => {
            debug!("Ignoring command addressed to @{}", name);
            Route::Ignore
        }
        Err(_) => Route::Unknown(command_token(text).to_string()),
    }
}

/// The leading `/word` of a command message, without any `@bot` suffix.
fn command_token(text: &str) -> &str {
    let first = text.split_whitespace().next().unwrap_or(text);
    first.split('@').next().unwrap_or(first)
}
