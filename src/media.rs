use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_VIDEO_BYTES: u64 = 100 * 1024 * 1024;
const MAX_FRAMES: usize = 10;
// One frame every two seconds, longest side capped at 1024px.
const FRAME_FILTER: &str =
    "fps=1/2,scale=min(1024\\,iw):min(1024\\,ih):force_original_aspect_ratio=decrease";

/// Video download and frame extraction: URL in, ordered base64 JPEG frames
/// out. Extraction shells out to ffmpeg in a scratch directory that is
/// removed whatever happens.
pub struct VideoPipeline {
    client: reqwest::Client,
    token: Option<String>,
    max_video_bytes: u64,
}

impl VideoPipeline {
    pub fn new(token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            max_video_bytes: DEFAULT_MAX_VIDEO_BYTES,
        }
    }

    /// Download the video and return up to 10 extracted frames, oldest
    /// first, base64-encoded for vision calls.
    pub async fn frames_from_url(&self, url: &str) -> Result<Vec<String>> {
        let video = self.download(url).await?;
        let frames = self.extract_frames(&video).await?;
        Ok(frames.iter().map(|f| STANDARD.encode(f)).collect())
    }

    /// Size-guarded download: reject on the advertised length, and again
    /// while streaming in case the advertisement lied.
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let head = self
            .request(self.client.head(url))
            .send()
            .await
            .context("Video HEAD request failed")?;
        if let Some(length) = head
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length > self.max_video_bytes {
                anyhow::bail!(
                    "Video too large: {length} bytes (limit {})",
                    self.max_video_bytes
                );
            }
        }

        let mut response = self
            .request(self.client.get(url))
            .send()
            .await
            .context("Video download failed")?
            .error_for_status()
            .context("Video download error")?;

        let mut video = Vec::new();
        while let Some(chunk) = response.chunk().await.context("Video stream interrupted")? {
            if (video.len() + chunk.len()) as u64 > self.max_video_bytes {
                anyhow::bail!(
                    "Video exceeded size limit during download (limit {})",
                    self.max_video_bytes
                );
            }
            video.extend_from_slice(&chunk);
        }
        info!(video_size = video.len(), "Video downloaded");
        Ok(video)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(DOWNLOAD_TIMEOUT);
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Extract JPEG frames with ffmpeg. Frames come back in playback order.
    async fn extract_frames(&self, video: &[u8]) -> Result<Vec<Vec<u8>>> {
        let scratch = std::env::temp_dir().join(format!("banterbot-frames-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch)
            .await
            .context("Failed to create scratch directory")?;

        let result = self.run_extraction(&scratch, video).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!("Failed to clean up scratch directory: {e}");
        }
        result
    }

    async fn run_extraction(&self, scratch: &Path, video: &[u8]) -> Result<Vec<Vec<u8>>> {
        let input = scratch.join("input.mp4");
        tokio::fs::write(&input, video)
            .await
            .context("Failed to write video to scratch directory")?;

        let pattern = scratch.join("frame_%03d.jpg");
        let output = tokio::process::Command::new("ffmpeg")
            .args([
                "-i",
                input.to_str().context("Scratch path is not UTF-8")?,
                "-vf",
                FRAME_FILTER,
                "-frames:v",
                &MAX_FRAMES.to_string(),
                "-q:v",
                "4",
                "-y",
                pattern.to_str().context("Scratch path is not UTF-8")?,
            ])
            .output()
            .await
            .context("Failed to run ffmpeg")?;

        if !output.status.success() {
            anyhow::bail!(
                "ffmpeg frame extraction failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let mut paths: Vec<PathBuf> = Vec::new();
        let mut entries = tokio::fs::read_dir(scratch)
            .await
            .context("Failed to list scratch directory")?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("frame_") {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            frames.push(tokio::fs::read(&path).await?);
        }
        debug!(extracted_frames = frames.len(), "Frames extracted");
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_download_rejects_advertised_oversize() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("content-length", "999999999"),
            )
            .mount(&server)
            .await;

        let mut pipeline = VideoPipeline::new(None);
        pipeline.max_video_bytes = 1024;
        let err = pipeline.download(&server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_download_rejects_oversize_stream() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048]))
            .mount(&server)
            .await;

        let mut pipeline = VideoPipeline::new(None);
        pipeline.max_video_bytes = 1024;
        let err = pipeline.download(&server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("size limit"));
    }

    #[tokio::test]
    async fn test_download_within_limit_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 512]))
            .mount(&server)
            .await;

        let mut pipeline = VideoPipeline::new(None);
        pipeline.max_video_bytes = 1024;
        let video = pipeline.download(&server.uri()).await.unwrap();
        assert_eq!(video.len(), 512);
    }

    #[tokio::test]
    async fn test_bearer_token_is_attached_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(wiremock::matchers::bearer_token("media-token"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::bearer_token("media-token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tiny".to_vec()))
            .mount(&server)
            .await;

        let pipeline = VideoPipeline::new(Some("media-token".to_string()));
        let video = pipeline.download(&server.uri()).await.unwrap();
        assert_eq!(video, b"tiny");
    }
}
