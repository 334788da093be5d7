use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Resolves configuration values that reference a secret store. Values shaped
/// `projects/.../secrets/.../versions/...` are fetched; anything else passes
/// through untouched.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, value: &str) -> Result<String>;
}

/// No-op resolver for local runs and tests.
pub struct PassthroughResolver;

#[async_trait]
impl SecretResolver for PassthroughResolver {
    async fn resolve(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    payload: AccessPayload,
}

#[derive(Debug, Deserialize)]
struct AccessPayload {
    data: String,
}

/// REST secret-store client. Resolved references are cached for the process
/// lifetime, so repeated config loads do not refetch.
pub struct RestSecretResolver {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    cache: RwLock<HashMap<String, String>>,
}

impl RestSecretResolver {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn access(&self, reference: &str) -> Result<String> {
        let url = format!("{}/{}:access", self.base_url, reference);
        let mut request = self.client.get(&url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach secret store for {reference}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Secret store error ({status}) for {reference}: {body}");
        }

        let access: AccessResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse secret payload for {reference}"))?;
        let bytes = STANDARD
            .decode(access.payload.data)
            .with_context(|| format!("Secret payload for {reference} is not valid base64"))?;
        String::from_utf8(bytes)
            .with_context(|| format!("Secret payload for {reference} is not valid UTF-8"))
    }
}

#[async_trait]
impl SecretResolver for RestSecretResolver {
    async fn resolve(&self, value: &str) -> Result<String> {
        if !value.starts_with("projects/") {
            return Ok(value.to_string());
        }
        if let Some(cached) = self.cache.read().await.get(value) {
            return Ok(cached.clone());
        }
        let resolved = self.access(value).await?;
        debug!("Resolved secret reference: {value}");
        self.cache
            .write()
            .await
            .insert(value.to_string(), resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_plain_values_pass_through_without_a_request() {
        let resolver = RestSecretResolver::new("http://127.0.0.1:1".to_string(), None);
        let value = resolver.resolve("plain-token").await.unwrap();
        assert_eq!(value, "plain-token");
    }

    #[tokio::test]
    async fn test_reference_is_fetched_decoded_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/projects/p/secrets/tg/versions/latest:access",
            ))
            .and(bearer_token("store-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "payload": {"data": STANDARD.encode("s3cret")}
            })))
            // Cache means exactly one roundtrip for two resolves.
            .expect(1)
            .mount(&server)
            .await;

        let resolver =
            RestSecretResolver::new(server.uri(), Some("store-token".to_string()));
        let reference = "projects/p/secrets/tg/versions/latest";
        assert_eq!(resolver.resolve(reference).await.unwrap(), "s3cret");
        assert_eq!(resolver.resolve(reference).await.unwrap(), "s3cret");
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let resolver = RestSecretResolver::new(server.uri(), None);
        let err = resolver
            .resolve("projects/p/secrets/x/versions/1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
