//! Relay module - forwards Telegram chats to Gemini.

pub mod catalog;
pub mod commands;
pub mod gateway;
pub mod gemini;
pub mod markdown;
pub mod router;
pub mod session;
pub mod telegram;


pub use catalog::{ModelCatalog, fallback_models};
pub use gateway::ModelGateway;
pub use gemini::GeminiClient;
pub use router::{GENERIC_FAILURE, Incoming, Reply, Router};
pub use session::SessionStore;
pub use telegram::TelegramClient;
