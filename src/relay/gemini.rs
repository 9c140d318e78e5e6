//! Gemini API client for chat generation and model discovery.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::relay::catalog::ModelInfo;
use crate::relay::gateway::{GatewayError, ModelGateway};
use crate::relay::session::{Part, Turn};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Upper bound on `models.list` pages followed in one refresh.
const MAX_MODEL_PAGES: usize = 10;

/// Finish reasons that mean the answer was withheld rather than empty.
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text { text: &'a str },
    Inline { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

impl<'a> Content<'a> {
    fn from_turn(turn: &'a Turn) -> Self {
        let parts = turn
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => RequestPart::Text { text },
                Part::Image(image) => RequestPart::Inline {
                    inline_data: InlineData {
                        mime_type: &image.mime_type,
                        data: base64::engine::general_purpose::STANDARD.encode(&image.data),
                    },
                },
            })
            .collect();

        Self {
            role: turn.role.as_str(),
            parts,
        }
    }
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
    status: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<RemoteModel>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RemoteModel {
    name: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "supportedGenerationMethods", default)]
    supported_generation_methods: Vec<String>,
}

impl GeminiClient {
    pub fn new(api_key: String, base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn fetch_model_page(&self, page_token: Option<&str>) -> Result<ListModelsResponse, GatewayError> {
        let url = format!("{}/v1beta/models", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .query(&[("pageSize", "1000")]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Http(format!("failed to read response: {e}")))?;

        debug!("Gemini models.list status: {status}");

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ModelGateway for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        history: &[Turn],
        turn: &Turn,
    ) -> Result<String, GatewayError> {
        let contents: Vec<Content> = history
            .iter()
            .chain(std::iter::once(turn))
            .map(Content::from_turn)
            .collect();
        info!(
            "🤖 Sending to Gemini: model={}, {} turn(s), image={}",
            model,
            contents.len(),
            turn.has_image()
        );

        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&GenerateRequest { contents })
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Http(format!("failed to read response: {e}")))?;

        debug!("Gemini response status: {status}");

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        parse_generate_response(&body)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_MODEL_PAGES {
            let page = self.fetch_model_page(page_token.as_deref()).await?;
            models.extend(collect_models(page.models));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(models)
    }
}

/// Map a non-success response to a gateway error, preferring the API's own message.
fn api_error(status: u16, body: &str) -> GatewayError {
    let (message, api_status) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.message, envelope.error.status),
        Err(_) => (body.chars().take(200).collect(), None),
    };

    if status == 429 || api_status.as_deref() == Some("RESOURCE_EXHAUSTED") {
        GatewayError::Quota(message)
    } else {
        GatewayError::Api { status, message }
    }
}

/// Join the text parts of the first candidate.
fn parse_generate_response(body: &str) -> Result<String, GatewayError> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| GatewayError::Parse(e.to_string()))?;

    let block_reason = parsed.prompt_feedback.and_then(|f| f.block_reason);
    let candidate = match parsed.candidates.and_then(|c| c.into_iter().next()) {
        Some(candidate) => candidate,
        None => {
            return Err(match block_reason {
                Some(reason) => GatewayError::Blocked(reason),
                None => GatewayError::Empty,
            });
        }
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(match candidate.finish_reason {
            Some(reason) if BLOCKING_FINISH_REASONS.contains(&reason.as_str()) => {
                GatewayError::Blocked(reason)
            }
            _ => GatewayError::Empty,
        });
    }

    Ok(text)
}

/// Keep models that can generate content; ids lose their `models/` prefix.
fn collect_models(models: Vec<RemoteModel>) -> Vec<ModelInfo> {
    models
        .into_iter()
        .filter(|m| {
            m.supported_generation_methods
                .iter()
                .any(|method| method == "generateContent")
        })
        .map(|m| {
            let id = m.name.trim_start_matches("models/").to_string();
            let display_name = m
                .display_name
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| id.clone());
            ModelInfo::new(id, display_name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::Image;
    use mockito::Matcher;

    fn client(url: &str) -> GeminiClient {
        GeminiClient::new("test-key".to_string(), url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_generate_sends_history_and_joins_parts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-2.0-flash:generateContent")
            .match_header("x-goog-api-key", "test-key")
            .match_body(Matcher::Json(serde_json::json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hello"}]},
                    {"role": "user", "parts": [{"text": "how are you"}]}
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"fine, "},{"text":"thanks"}]},"finishReason":"STOP"}]}"#,
            )
            .create_async()
            .await;

        let history = vec![Turn::user("hi"), Turn::model("hello")];
        let reply = client(&server.url())
            .generate("gemini-2.0-flash", &history, &Turn::user("how are you"))
            .await
            .unwrap();

        assert_eq!(reply, "fine, thanks");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_sends_image_inline() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-1.5-pro:generateContent")
            .match_body(Matcher::Json(serde_json::json!({
                "contents": [
                    {"role": "user", "parts": [
                        {"text": "What's in this image?"},
                        {"inline_data": {"mime_type": "image/jpeg", "data": "AQID"}}
                    ]}
                ]
            })))
            .with_status(200)
            .with_body(r#"{"candidates":[{"content":{"parts":[{"text":"a cat"}]}}]}"#)
            .create_async()
            .await;

        let turn = Turn::user_with_image(
            "What's in this image?",
            Image {
                data: vec![1, 2, 3],
                mime_type: "image/jpeg".to_string(),
            },
        );
        let reply = client(&server.url())
            .generate("gemini-1.5-pro", &[], &turn)
            .await
            .unwrap();

        assert_eq!(reply, "a cat");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_quota_exhausted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-2.0-flash:generateContent")
            .with_status(429)
            .with_body(r#"{"error":{"code":429,"message":"Resource has been exhausted","status":"RESOURCE_EXHAUSTED"}}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .generate("gemini-2.0-flash", &[], &Turn::user("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Quota(ref m) if m.contains("exhausted")));
    }

    #[tokio::test]
    async fn test_generate_api_error_uses_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-2.0-flash:generateContent")
            .with_status(400)
            .with_body(r#"{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .generate("gemini-2.0-flash", &[], &Turn::user("hi"))
            .await
            .unwrap_err();

        match err {
            GatewayError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "API key not valid");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_models_filters_generate_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1beta/models")
            .match_query(Matcher::UrlEncoded("pageSize".into(), "1000".into()))
            .match_header("x-goog-api-key", "test-key")
            .with_status(200)
            .with_body(
                r#"{"models":[
                    {"name":"models/gemini-2.0-flash","displayName":"Gemini 2.0 Flash","supportedGenerationMethods":["generateContent","countTokens"]},
                    {"name":"models/text-embedding-004","displayName":"Text Embedding 004","supportedGenerationMethods":["embedContent"]},
                    {"name":"models/gemini-exp","supportedGenerationMethods":["generateContent"]}
                ]}"#,
            )
            .create_async()
            .await;

        let models = client(&server.url()).list_models().await.unwrap();

        assert_eq!(
            models,
            vec![
                ModelInfo::new("gemini-2.0-flash", "Gemini 2.0 Flash"),
                ModelInfo::new("gemini-exp", "gemini-exp"),
            ]
        );
        mock.assert_async().await;
    }

    #[test]
    fn test_parse_prompt_blocked() {
        let err = parse_generate_response(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Blocked(ref r) if r == "SAFETY"));
    }

    #[test]
    fn test_parse_candidate_blocked() {
        let err = parse_generate_response(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Blocked(_)));
    }

    #[test]
    fn test_parse_empty_candidates() {
        let err = parse_generate_response(r#"{"candidates":[]}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Empty));
    }

    #[test]
    fn test_parse_malformed() {
        let err = parse_generate_response("<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, GatewayError::Parse(_)));
    }

    #[test]
    fn test_api_error_plain_body() {
        let err = api_error(503, "upstream unavailable");
        assert!(matches!(err, GatewayError::Api { status: 503, ref message } if message == "upstream unavailable"));
    }
}
