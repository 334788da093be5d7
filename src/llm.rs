use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::models::{ReplyContext, StyleProfile};

const MAX_RETRIES: u32 = 3;
const BACKOFF_SECONDS: u64 = 2;
const TEXT_TIMEOUT: Duration = Duration::from_secs(20);
const VISION_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_VISION_FRAMES: usize = 10;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat client. Rate limits are retried with linear
/// backoff; exhaustion yields an empty string (the pipeline reads that as
/// "no reply"). Any other HTTP failure is a hard error.
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    vision_model: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, vision_model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            vision_model,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Point the client at a different API base (for testing).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Generate a style-matched reply from the conversation snippet.
    pub async fn generate_reply(&self, context: &ReplyContext) -> Result<String> {
        let mut system_prompt = context.settings.rendered_system_prompt();
        let style_hint = style_guidance(&context.style_profile);
        if !style_hint.is_empty() {
            system_prompt = format!("{system_prompt} {style_hint}");
        }

        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        for msg in &context.recent_messages {
            match msg.text.as_deref() {
                Some(text) if !text.is_empty() => {
                    messages.push(json!({"role": "user", "content": text}));
                }
                _ => {}
            }
        }

        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": context.settings.model_temperature,
            "max_tokens": context.settings.max_tokens,
        });

        let reply = self.chat(payload, TEXT_TIMEOUT).await?;
        Ok(trim_reply(&reply, context.settings.max_reply_sentences))
    }

    /// Summarize video frames with the vision model. Frames are base64 JPEG
    /// data, at most 10 of which are sent.
    pub async fn describe_frames(&self, frames: &[String], caption: Option<&str>) -> Result<String> {
        let mut instruction = "Analyze these video frames extracted at 2-second intervals. \
             Describe what's happening in the video, the main subjects, actions, \
             setting, and overall theme. Be concise but comprehensive."
            .to_string();
        if let Some(caption) = caption {
            instruction.push_str(&format!("\n\nVideo caption: {caption}"));
        }

        let mut content = vec![json!({"type": "text", "text": instruction})];
        for frame in frames.iter().take(MAX_VISION_FRAMES) {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:image/jpeg;base64,{frame}"),
                    "detail": "low",
                }
            }));
        }

        let payload = json!({
            "model": self.vision_model,
            "messages": [{"role": "user", "content": content}],
            "max_tokens": 500,
            "temperature": 0.7,
        });

        let analysis = self.chat(payload, VISION_TIMEOUT).await?;
        debug!(analysis_length = analysis.len(), "Video analysis complete");
        Ok(analysis)
    }

    /// Generate a style-matched comment about an analyzed video.
    pub async fn video_comment(&self, analysis: &str, context: &ReplyContext) -> Result<String> {
        let mut system_prompt = format!(
            "You are commenting on a short video shared in a group chat. \
             Write an engaging, natural comment that responds to the video content. \
             Keep it brief ({} sentences or fewer). \
             Be authentic and conversational, like a real person commenting.",
            context.settings.max_reply_sentences
        );
        let style_hint = style_guidance(&context.style_profile);
        if !style_hint.is_empty() {
            system_prompt = format!("{system_prompt} {style_hint}");
        }

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": format!(
                    "Video content: {analysis}\n\nWrite a natural comment about this video."
                )},
            ],
            "temperature": context.settings.model_temperature,
            "max_tokens": 200,
        });

        let comment = self.chat(payload, TEXT_TIMEOUT).await?;
        Ok(trim_reply(&comment, context.settings.max_reply_sentences))
    }

    async fn chat(&self, payload: serde_json::Value, timeout: Duration) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        for attempt in 1..=MAX_RETRIES {
            match self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .timeout(timeout)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!(attempt, "OpenAI rate limited");
                }
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        anyhow::bail!("OpenAI API error ({status}): {body}");
                    }
                    let parsed: ChatResponse = response
                        .json()
                        .await
                        .context("Failed to parse OpenAI response")?;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .unwrap_or_default();
                    return Ok(content.trim().to_string());
                }
                Err(e) => {
                    warn!(attempt, "OpenAI request failed: {e}");
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_secs(BACKOFF_SECONDS * attempt as u64)).await;
            }
        }

        error!("OpenAI request retries exhausted");
        Ok(String::new())
    }
}

/// Turn the style profile into prompt guidance. Thresholds: texts averaging
/// 40 chars or less read as "short and punchy", 120 or more as long-form;
/// an emoji ratio of 2% invites emoji, 0.5% or less forbids them.
pub(crate) fn style_guidance(profile: &StyleProfile) -> String {
    let mut hints: Vec<String> = Vec::new();

    if !profile.common_words.is_empty() {
        hints.push(format!(
            "Common slang/words: {}",
            profile.common_words.join(", ")
        ));
    }

    if profile.average_length <= 40.0 {
        hints.push("Keep replies short and punchy.".to_string());
    } else if profile.average_length >= 120.0 {
        hints.push("Longer, more detailed replies are acceptable.".to_string());
    }

    if profile.emoji_ratio >= 0.02 {
        hints.push("Use emojis occasionally if it feels natural.".to_string());
    } else if profile.emoji_ratio <= 0.005 {
        hints.push("Avoid emojis unless the user uses them first.".to_string());
    }

    if hints.is_empty() {
        return String::new();
    }
    format!("Style notes: {}", hints.join(" "))
}

/// Trim to the first `max_sentences` complete sentences. A sentence ends at
/// `.`/`!`/`?` followed by whitespace. Zero disables trimming.
pub(crate) fn trim_reply(text: &str, max_sentences: usize) -> String {
    let text = text.trim();
    if max_sentences == 0 {
        return text.to_string();
    }

    let bytes = text.as_bytes();
    let mut parts: Vec<&str> = Vec::new();
    let mut start = 0;
    for i in 0..bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?')
            && bytes.get(i + 1).is_some_and(|b| b.is_ascii_whitespace())
        {
            parts.push(text[start..=i].trim());
            start = i + 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }

    if parts.len() <= max_sentences {
        return text.to_string();
    }
    parts[..max_sentences].join(" ")
}
