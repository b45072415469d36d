//! Streaming chat completions
//!
//! The response is read as server-sent events and exposed as a lazy stream of
//! text chunks. The stream ends when the body is exhausted, or after yielding a
//! single error.

use crate::auth_client::{RequestOptions, SessionClient};
use crate::error::{ClientError, Result};
use crate::refresher::TokenRefresher;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Message body: plain text, or a list of text and image parts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        MessageContent::Parts(parts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Image by URL; `data:` URLs carry inline images
    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new("system", content)
    }

    fn new(role: &str, content: impl Into<MessageContent>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }
}

/// Extract the delta text from one SSE line, if it carries any
pub(crate) fn parse_sse_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line == "data: [DONE]" {
        return None;
    }

    let payload = line.strip_prefix("data: ")?;
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(event) => event["choices"][0]["delta"]["content"]
            .as_str()
            .filter(|content| !content.is_empty())
            .map(str::to_string),
        Err(e) => {
            warn!(error = %e, "Skipping malformed SSE event");
            None
        }
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

struct SseState {
    body: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    finished: bool,
}

impl SseState {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(chunk) = parse_sse_line(&String::from_utf8_lossy(&line)) {
                self.pending.push_back(chunk);
            }
        }
    }

    fn drain_tail(&mut self) {
        let tail = std::mem::take(&mut self.buffer);
        if let Some(chunk) = parse_sse_line(&String::from_utf8_lossy(&tail)) {
            self.pending.push_back(chunk);
        }
    }
}

/// Lazy, non-restartable sequence of chat text chunks
///
/// Dropping the stream closes the underlying response body.
pub struct ChatStream {
    inner: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
}

impl ChatStream {
    /// Build a chunk stream over a raw SSE body
    pub fn from_body<S, E>(body: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: Into<ClientError> + 'static,
    {
        let state = SseState {
            body: Box::pin(body.map(|chunk: std::result::Result<Bytes, E>| -> Result<Bytes> {
                chunk.map_err(Into::into)
            })),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        let chunks = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.finished {
                    return None;
                }

                match state.body.next().await {
                    Some(Ok(bytes)) => {
                        state.buffer.extend_from_slice(&bytes);
                        state.drain_lines();
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.clear();
                        return Some((Err(e), state));
                    }
                    None => {
                        debug!("Chat stream complete");
                        state.finished = true;
                        state.drain_tail();
                    }
                }
            }
        });

        Self {
            inner: Box::pin(chunks),
        }
    }
}

impl Stream for ChatStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<R: TokenRefresher> SessionClient<R> {
    /// Start a streaming chat completion with the session's token
    ///
    /// Uses the same refresh-and-replay-once handling as [`SessionClient::execute`].
    pub async fn chat_completion_stream(&self, request: &ChatCompletionRequest) -> Result<ChatStream> {
        if !self.is_authenticated() {
            return Err(ClientError::NotAuthenticated);
        }

        let mut body = serde_json::to_value(request)?;
        body["stream"] = serde_json::Value::Bool(true);

        let response = self
            .send_authorized(CHAT_COMPLETIONS_PATH, &RequestOptions::post(body))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await?;
            return Err(ClientError::from_error_body(status, &body));
        }

        Ok(ChatStream::from_body(response.bytes_stream()))
    }
}
