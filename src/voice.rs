//! Speech adapters: OpenAI transcription and synthesis endpoints.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{error, warn};

/// Fallback transcription model when the configured one rejects the audio.
const STT_FALLBACK_MODEL: &str = "whisper-1";

/// Speaking instructions tuned for regulation read-outs.
const TTS_INSTRUCTIONS: &str = "Speak clearly and at a moderate pace. \
    When reading regulation numbers like 'II-1/3-6' or 'SOLAS Chapter XII', \
    pronounce each part distinctly with a brief pause between segments. \
    Emphasize numerical values such as dimensions, tonnage, and dates. \
    Maintain a professional, authoritative tone.";

/// Result of one transcription call.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// Recognised text.
    pub text: String,
    /// Model that produced it (configured or fallback).
    pub model_used: String,
}

/// Speech-to-text client for the OpenAI transcription endpoint.
#[derive(Clone)]
pub struct SttClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl SttClient {
    /// Builds a new transcription client.
    pub fn new(api_key: String, base_url: &str, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build STT HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/audio/transcriptions", base_url.trim_end_matches('/')),
            api_key: api_key.trim().to_string(),
            model,
        })
    }

    /// Transcribes an audio clip, falling back to the whisper model when the
    /// configured model fails.
    pub async fn transcribe(
        &self,
        audio: Vec<u8>,
        audio_format: &str,
        language: Option<&str>,
    ) -> Result<Transcription> {
        match self
            .transcribe_with(&self.model, audio.clone(), audio_format, language)
            .await
        {
            Ok(text) => Ok(Transcription {
                text,
                model_used: self.model.clone(),
            }),
            Err(err) => {
                warn!(model = %self.model, error = %err, "transcription failed, using fallback model");
                let text = self
                    .transcribe_with(STT_FALLBACK_MODEL, audio, audio_format, language)
                    .await
                    .map_err(|fallback_err| {
                        error!(error = %fallback_err, "fallback transcription also failed");
                        fallback_err
                    })?;
                Ok(Transcription {
                    text,
                    model_used: STT_FALLBACK_MODEL.to_string(),
                })
            }
        }
    }

    async fn transcribe_with(
        &self,
        model: &str,
        audio: Vec<u8>,
        audio_format: &str,
        language: Option<&str>,
    ) -> Result<String> {
        let file = Part::bytes(audio).file_name(format!("audio.{audio_format}"));
        let mut form = Form::new()
            .text("model", model.to_string())
            .part("file", file);
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("failed to call transcription endpoint")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("transcription request failed ({}): {}", status, body);
        }
        let parsed: TranscriptionResponse = resp
            .json()
            .await
            .context("failed to parse transcription response")?;
        Ok(parsed.text)
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Text-to-speech client for the OpenAI speech endpoint. Produces mp3.
#[derive(Clone)]
pub struct TtsClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    voice: String,
}

impl TtsClient {
    /// Builds a new synthesis client.
    pub fn new(
        api_key: String,
        base_url: &str,
        model: String,
        voice: String,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build TTS HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/audio/speech", base_url.trim_end_matches('/')),
            api_key: api_key.trim().to_string(),
            model,
            voice,
        })
    }

    /// Synthesises mp3 audio for the given text.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "instructions": TTS_INSTRUCTIONS,
            "response_format": "mp3",
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to call speech endpoint")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("speech request failed ({}): {}", status, body);
        }
        let bytes = resp.bytes().await.context("failed to read audio body")?;
        Ok(bytes.to_vec())
    }
}

static RE_SOURCE_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\n*(参考来源|Sources:|References:).*$").expect("valid regex"));
static RE_BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("valid regex"));
static RE_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#{1,6}\s*").expect("valid regex"));
static RE_QUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^>\s*").expect("valid regex"));
static RE_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[-*]\s*").expect("valid regex"));
static RE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").expect("valid regex"));
static RE_BRACKET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]").expect("valid regex"));
static RE_BLANKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Strips markdown structure and reference tails from an answer so the
/// synthesised speech reads naturally. Truncates at a sentence boundary
/// near `max_length` characters.
pub fn prepare_tts_text(answer: &str, max_length: usize) -> String {
    let mut text = RE_SOURCE_TAIL.replace(answer, "").into_owned();
    text = RE_BOLD.replace_all(&text, "$1").into_owned();
    text = RE_HEADING.replace_all(&text, "").into_owned();
    text = RE_QUOTE.replace_all(&text, "").into_owned();
    text = RE_BULLET.replace_all(&text, "").into_owned();
    text = RE_URL.replace_all(&text, "").into_owned();
    text = RE_BRACKET.replace_all(&text, "$1").into_owned();
    text = RE_BLANKS.replace_all(&text, "\n\n").into_owned();
    let text = text.trim();

    if text.chars().count() <= max_length {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_length).collect();
    match truncated.rfind('.') {
        Some(pos) if pos > max_length / 2 => truncated[..=pos].to_string(),
        _ => truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tts_text_drops_markdown_and_sources() {
        let answer = "**直接答案：A-0**\n\n> SOLAS II-2/9 states...\n\n- item one\n\nSee https://www.imorules.com/page [SOLAS II-2/9]\n\n参考来源\n- [SOLAS II-2/9] → https://example.com";
        let prepared = prepare_tts_text(answer, 1500);
        assert!(!prepared.contains("**"));
        assert!(!prepared.contains("https://"));
        assert!(!prepared.contains("参考来源"));
        assert!(prepared.contains("直接答案：A-0"));
        assert!(prepared.contains("SOLAS II-2/9"));
    }

    #[test]
    fn tts_text_truncates_at_sentence_boundary() {
        let answer = format!("{}. {}", "a".repeat(80), "b".repeat(200));
        let prepared = prepare_tts_text(&answer, 100);
        assert_eq!(prepared, format!("{}.", "a".repeat(80)));
    }

    #[test]
    fn short_answers_pass_through() {
        assert_eq!(prepare_tts_text("A-0 rating.", 1500), "A-0 rating.");
    }
}
