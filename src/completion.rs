//! Hosted chat-completion client.
//!
//! Talks to an OpenAI-compatible `/chat/completions` endpoint in two
//! modes: token streaming for ordinary text turns, and a one-shot call
//! used for multimodal (text + inline image) turns and staged pipelines.
//!
//! Streaming failures never discard what was already received: the
//! partial text travels inside [`StreamError`] so the caller can keep it
//! in the transcript. There is no automatic retry once the first token
//! has arrived; a bounded retry before that point is configurable and
//! defaults to off.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::models::{ConversationTurn, Role};

/// Cooperative cancellation flag, honored at every suspension point of a
/// turn (embedding, web search, the model request, each stream chunk).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A role-tagged message in hosted-chat-API shape.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Plain text, or multimodal parts for vision turns.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn from_turn(turn: &ConversationTurn) -> Self {
        match turn.role {
            Role::User => Self::user(turn.content.clone()),
            Role::Assistant => Self::assistant(turn.content.clone()),
        }
    }

    /// A single multimodal user message carrying text plus an inline
    /// base64 image, the shape used when vision bypasses retrieval.
    pub fn user_with_image(text: impl Into<String>, media_type: &str, image: &[u8]) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", media_type, encoded),
                    },
                },
            ]),
        }
    }

    /// True when the message carries multimodal parts.
    pub fn is_multimodal(&self) -> bool {
        matches!(self.content, MessageContent::Parts(_))
    }
}

/// Streaming failure. The partial text received before the failure is
/// preserved so the caller can keep it in the transcript.
#[derive(Debug)]
pub enum StreamError {
    Cancelled { partial: String },
    Api { partial: String, message: String },
}

impl StreamError {
    pub fn partial(&self) -> &str {
        match self {
            StreamError::Cancelled { partial } => partial,
            StreamError::Api { partial, .. } => partial,
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Cancelled { .. } => write!(f, "stream cancelled"),
            StreamError::Api { message, .. } => write!(f, "completion stream failed: {}", message),
        }
    }
}

impl std::error::Error for StreamError {}

/// Chat backend abstraction so the turn runner and stage pipeline can be
/// driven by the hosted client or an in-process fake in tests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One-shot completion; returns the full response text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Streaming completion. `on_token` is invoked for every delta as it
    /// arrives; the full text is returned on success.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        cancel: &CancelToken,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> std::result::Result<String, StreamError>;
}

/// Client for an OpenAI-compatible chat-completions endpoint.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct CompletionClient {
    base_url: String,
    model: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl CompletionClient {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?)
    }

    /// Issue the request, retrying transient failures up to
    /// `max_retries` times. No token has been received at this point, so
    /// retrying cannot duplicate output.
    async fn send_request(
        &self,
        client: &reqwest::Client,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "completion API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("completion API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("completion request failed after retries")))
    }
}

#[async_trait]
impl ChatBackend for CompletionClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let client = self.http_client()?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });

        let response = self.send_request(&client, &body).await?;
        let json: serde_json::Value = response.json().await?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing message content"))
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        cancel: &CancelToken,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> std::result::Result<String, StreamError> {
        let mut collected = String::new();

        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled { partial: collected });
        }

        let client = self.http_client().map_err(|e| StreamError::Api {
            partial: String::new(),
            message: e.to_string(),
        })?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });

        let response = self
            .send_request(&client, &body)
            .await
            .map_err(|e| StreamError::Api {
                partial: String::new(),
                message: e.to_string(),
            })?;

        let mut byte_stream = response.bytes_stream();
        // Byte buffer: a token split across network chunks must not be
        // decoded until its line is complete.
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(next) = byte_stream.next().await {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled { partial: collected });
            }

            let bytes = match next {
                Ok(b) => b,
                Err(e) => {
                    return Err(StreamError::Api {
                        partial: collected,
                        message: e.to_string(),
                    })
                }
            };

            buffer.extend_from_slice(&bytes);

            // Process complete lines; keep the trailing fragment.
            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);

                match parse_sse_line(&line) {
                    SseLine::Delta(token) => {
                        collected.push_str(&token);
                        on_token(&token);
                    }
                    SseLine::Done => return Ok(collected),
                    SseLine::Skip => {}
                }
            }
        }

        Ok(collected)
    }
}

enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Parse one server-sent-events line from the completion stream.
fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim(),
        None => return SseLine::Skip,
    };

    if payload == "[DONE]" {
        return SseLine::Done;
    }

    let json: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return SseLine::Skip,
    };

    match json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        Some(token) if !token.is_empty() => SseLine::Delta(token.to_string()),
        _ => SseLine::Skip,
    }
}
