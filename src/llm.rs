//! Anthropic chat adapter used for answer generation, coreference rewrites
//! and history summarisation.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;

/// A single conversation message handed to the chat model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Builds a user-role message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Builds an assistant-role message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    /// Model identifier.
    pub model: &'a str,
    /// Optional system prompt.
    pub system: Option<&'a str>,
    /// Conversation messages, user turn last.
    pub messages: &'a [ChatMessage],
    /// Completion token cap.
    pub max_tokens: usize,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Text and token accounting returned by a completed chat call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Concatenated text blocks of the response.
    pub text: String,
    /// Input tokens billed.
    pub input_tokens: u64,
    /// Output tokens billed.
    pub output_tokens: u64,
}

/// Async client for the Anthropic messages API with retry on transient
/// failures.
#[derive(Clone)]
pub struct AnthropicChat {
    client: reqwest::Client,
    endpoint: String,
    max_retries: usize,
}

const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

impl AnthropicChat {
    /// Builds a new Anthropic chat client.
    pub fn new(api_key: String, timeout: Duration, max_retries: usize) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Anthropic API key");
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Anthropic API key")?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Anthropic HTTP client")?;
        Ok(Self {
            client,
            endpoint: ANTHROPIC_ENDPOINT.to_string(),
            max_retries: max_retries.max(1),
        })
    }

    /// Runs one chat completion, retrying transient failures with backoff.
    pub async fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatOutcome> {
        let body = AnthropicRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system,
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.as_str(),
                    content: vec![AnthropicContentBlock {
                        kind: "text",
                        text: m.content.as_str(),
                    }],
                })
                .collect(),
        };

        let mut attempt = 0usize;
        loop {
            let response = self.client.post(&self.endpoint).json(&body).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: AnthropicResponse =
                            resp.json().await.context("failed to parse Anthropic response")?;
                        return outcome_from_response(parsed, request.model);
                    }
                    let text = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    bail!("Anthropic returned {}: {}", status, text);
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect() || err.is_request())
                        && attempt + 1 < self.max_retries
                    {
                        attempt += 1;
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

fn outcome_from_response(parsed: AnthropicResponse, model: &str) -> Result<ChatOutcome> {
    let text = parsed
        .content
        .into_iter()
        .filter_map(|block| match block {
            AnthropicResponseBlock::Text { text } => Some(text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        bail!("Anthropic response missing text content");
    }
    let usage = parsed.usage.unwrap_or_default();
    info!(
        model,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "llm call complete"
    );
    Ok(ChatOutcome {
        text,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    })
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<AnthropicContentBlock<'a>>,
}

#[derive(Serialize)]
struct AnthropicContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_blocks_concatenate_text_only() {
        let parsed: AnthropicResponse = serde_json::from_str(
            r#"{
                "content": [
                    {"type": "text", "text": "A-0 applies."},
                    {"type": "tool_use", "id": "x", "name": "y", "input": {}},
                    {"type": "text", "text": "[SOLAS II-2/9]"}
                ],
                "usage": {"input_tokens": 120, "output_tokens": 18}
            }"#,
        )
        .unwrap();
        let outcome = outcome_from_response(parsed, "test-model").unwrap();
        assert_eq!(outcome.text, "A-0 applies.\n[SOLAS II-2/9]");
        assert_eq!(outcome.input_tokens, 120);
        assert_eq!(outcome.output_tokens, 18);
    }

    #[test]
    fn empty_content_is_an_error() {
        let parsed: AnthropicResponse =
            serde_json::from_str(r#"{"content": []}"#).unwrap();
        assert!(outcome_from_response(parsed, "test-model").is_err());
    }
}
