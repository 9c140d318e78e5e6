//! Per-chat conversation state.
//!
//! Every chat gets its own [`Session`] behind its own async mutex, so turns
//! from one chat run one at a time while other chats proceed independently.
//! The outer map lock is only held for lookup and insert.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::relay::catalog::ModelCatalog;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// Raw image attached to a user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    Image(Image),
}

/// One role-tagged message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// A user turn carrying an image; `text` acts as the caption/prompt.
    pub fn user_with_image(text: impl Into<String>, image: Image) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text(text.into()), Part::Image(image)],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_image(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Image(_)))
    }
}

/// Conversational state of a single chat.
#[derive(Debug, Clone)]
pub struct Session {
    pub selected_model: String,
    pub history: Vec<Turn>,
}

impl Session {
    fn new(model: String) -> Self {
        Self {
            selected_model: model,
            history: Vec::new(),
        }
    }
}

/// The requested model is not in the supported list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidModel {
    pub name: String,
}

impl fmt::Display for InvalidModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported model '{}'", self.name)
    }
}

impl std::error::Error for InvalidModel {}

pub type SessionHandle = Arc<Mutex<Session>>;

/// In-memory sessions keyed by chat id. Lives as long as the process.
pub struct SessionStore {
    default_model: String,
    catalog: Arc<ModelCatalog>,
    sessions: Mutex<HashMap<i64, SessionHandle>>,
}

impl SessionStore {
    pub fn new(default_model: String, catalog: Arc<ModelCatalog>) -> Self {
        Self {
            default_model,
            catalog,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the chat's session, creating it with the default model on first use.
    pub async fn get_or_create(&self, chat_id: i64) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(chat_id)
            .or_insert_with(|| {
                info!("🆕 New session for chat {} ({})", chat_id, self.default_model);
                Arc::new(Mutex::new(Session::new(self.default_model.clone())))
            })
            .clone()
    }

    /// Clear the chat's history. The selected model is kept.
    pub async fn reset(&self, chat_id: i64) {
        let handle = self.get_or_create(chat_id).await;
        let mut session = handle.lock().await;
        let cleared = session.history.len();
        session.history.clear();
        info!("🧹 Cleared {} turn(s) for chat {}", cleared, chat_id);
    }

    /// Switch the chat to `name`. Fails without touching the session if the
    /// model is not supported.
    pub async fn set_model(&self, chat_id: i64, name: &str) -> Result<(), InvalidModel> {
        if !self.catalog.contains(name) {
            return Err(InvalidModel {
                name: name.to_string(),
            });
        }

        let handle = self.get_or_create(chat_id).await;
        let mut session = handle.lock().await;
        info!("🔀 Chat {} model {} → {}", chat_id, session.selected_model, name);
        session.selected_model = name.to_string();
        Ok(())
    }

    pub async fn selected_model(&self, chat_id: i64) -> String {
        let handle = self.get_or_create(chat_id).await;
        let session = handle.lock().await;
        session.selected_model.clone()
    }
}
