//! Seam between the router and the generative-AI backend.

use async_trait::async_trait;
use std::fmt;

use crate::relay::catalog::ModelInfo;
use crate::relay::session::Turn;

/// A failed call to the model backend.
#[derive(Debug)]
pub enum GatewayError {
    /// Request never got a response (connect, timeout, body read).
    Http(String),
    /// Backend answered with a non-success status.
    Api { status: u16, message: String },
    /// Rate limit or quota exhausted.
    Quota(String),
    /// Prompt or answer was blocked by the backend's safety filters.
    Blocked(String),
    /// Response body could not be understood.
    Parse(String),
    /// Response contained no usable text.
    Empty,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Http(e) => write!(f, "HTTP error: {e}"),
            GatewayError::Api { status, message } => write!(f, "API error {status}: {message}"),
            GatewayError::Quota(e) => write!(f, "quota exhausted: {e}"),
            GatewayError::Blocked(reason) => write!(f, "blocked: {reason}"),
            GatewayError::Parse(e) => write!(f, "parse error: {e}"),
            GatewayError::Empty => write!(f, "empty response"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Generative-AI backend. The router is the only caller of `generate`.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Answer `turn` in the context of `history` using `model`.
    async fn generate(
        &self,
        model: &str,
        history: &[Turn],
        turn: &Turn,
    ) -> Result<String, GatewayError>;

    /// Models that support content generation.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError>;
}

#[cfg(test)]
pub mod testing {
    //! Scripted gateway for router and catalog tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// What `generate` was asked to do.
    #[derive(Debug, Clone)]
    pub struct GenerateCall {
        pub model: String,
        pub history_len: usize,
        pub turn: Turn,
    }

    /// Replies are popped from a queue; when it is empty the gateway echoes
    /// the turn text back as `echo: <text>`.
    pub struct FakeGateway {
        replies: Mutex<VecDeque<Result<String, GatewayError>>>,
        calls: Mutex<Vec<GenerateCall>>,
        models: Option<Vec<ModelInfo>>,
        list_calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            Self {
                replies: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                models: None,
                list_calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
            self.models = Some(models);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn push_reply(&self, text: &str) {
            self.replies.lock().unwrap().push_back(Ok(text.to_string()));
        }

        pub fn push_error(&self, err: GatewayError) {
            self.replies.lock().unwrap().push_back(Err(err));
        }

        pub fn calls(&self) -> Vec<GenerateCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn generate_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn list_count(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelGateway for FakeGateway {
        async fn generate(
            &self,
            model: &str,
            history: &[Turn],
            turn: &Turn,
        ) -> Result<String, GatewayError> {
            self.calls.lock().unwrap().push(GenerateCall {
                model: model.to_string(),
                history_len: history.len(),
                turn: turn.clone(),
            });

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let scripted = self.replies.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(format!("echo: {}", turn.text())))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.models
                .clone()
                .ok_or_else(|| GatewayError::Http("offline".to_string()))
        }
    }
}
