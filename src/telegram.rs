use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
// Telegram caps messages at 4096 chars; stay under it with margin.
const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

/// Thin Telegram Bot API client: send a message, resolve a file id to a
/// download URL. Dispatch failures propagate to the caller.
pub struct TelegramClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl TelegramClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            api_base: "https://api.telegram.org".to_string(),
        }
    }

    /// Point the client at a different API base (for testing).
    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    /// Send text to a chat, splitting chunks that exceed Telegram's limit.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            let response = self
                .client
                .post(self.method_url("sendMessage"))
                .timeout(REQUEST_TIMEOUT)
                .json(&json!({"chat_id": chat_id, "text": chunk}))
                .send()
                .await
                .context("Failed to reach Telegram sendMessage")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Telegram sendMessage error ({status}): {body}");
            }
        }
        debug!(chat_id, "Message dispatched");
        Ok(())
    }

    /// Resolve a file id to a direct download URL.
    pub async fn get_file_url(&self, file_id: &str) -> Result<String> {
        let response = self
            .client
            .post(self.method_url("getFile"))
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({"file_id": file_id}))
            .send()
            .await
            .context("Failed to reach Telegram getFile")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram getFile error ({status}): {body}");
        }

        let parsed: ApiResponse<FileInfo> = response
            .json()
            .await
            .context("Failed to parse Telegram getFile response")?;
        if !parsed.ok {
            anyhow::bail!(
                "Telegram getFile rejected: {}",
                parsed.description.unwrap_or_default()
            );
        }
        let file_path = parsed
            .result
            .and_then(|f| f.file_path)
            .context("Telegram getFile response missing file_path")?;
        Ok(format!(
            "{}/file/bot{}/{file_path}",
            self.api_base, self.token
        ))
    }
}

/// Split long messages for Telegram's 4096 char limit, preferring newline
/// then space boundaries, never splitting inside a UTF-8 char.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_split_message_short_text_is_untouched() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
    }

    #[test]
    fn test_split_message_prefers_newline_then_space() {
        let text = "first line\nsecond line that goes on";
        let chunks = split_message(text, 15);
        assert_eq!(chunks[0], "first line\n");
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(chunk.len() <= 15);
        }
    }

    #[test]
    fn test_split_message_respects_utf8_boundaries() {
        let text = "ありがとうございました".repeat(10);
        let chunks = split_message(&text, 25);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(chunk.len() <= 25);
        }
    }

    #[tokio::test]
    async fn test_send_message_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottest-token/sendMessage"))
            .and(body_json(serde_json::json!({"chat_id": -100, "text": "hey"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"ok": true, "result": {"message_id": 1}}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            TelegramClient::new("test-token".to_string()).with_api_base(server.uri());
        client.send_message(-100, "hey").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_message_splits_long_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottest-token/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"ok": true, "result": {"message_id": 1}}),
            ))
            .expect(2)
            .mount(&server)
            .await;

        let client =
            TelegramClient::new("test-token".to_string()).with_api_base(server.uri());
        let long = "word ".repeat(1200); // 6000 chars
        client.send_message(-100, &long).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_message_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad chat"))
            .mount(&server)
            .await;

        let client =
            TelegramClient::new("test-token".to_string()).with_api_base(server.uri());
        assert!(client.send_message(-100, "hey").await.is_err());
    }

    #[tokio::test]
    async fn test_get_file_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottest-token/getFile"))
            .and(body_json(serde_json::json!({"file_id": "vid-abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {"file_id": "vid-abc", "file_path": "videos/file_1.mp4"}
            })))
            .mount(&server)
            .await;

        let client =
            TelegramClient::new("test-token".to_string()).with_api_base(server.uri());
        let url = client.get_file_url("vid-abc").await.unwrap();
        assert_eq!(
            url,
            format!("{}/file/bottest-token/videos/file_1.mp4", server.uri())
        );
    }
}
