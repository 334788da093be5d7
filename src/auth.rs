use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct PushClaims {
    #[serde(default)]
    email: Option<String>,
}

/// Verifies the bearer identity token on queue push deliveries against the
/// configured audience and issuer. A failure here is answered with a server
/// error so the queue retries with its own backoff.
pub struct PushTokenVerifier {
    client: reqwest::Client,
    jwks_url: String,
    issuer: String,
    audience: Option<String>,
    skip: bool,
    jwks_cache: RwLock<Option<(Instant, JwkSet)>>,
}

impl PushTokenVerifier {
    pub fn new(jwks_url: String, issuer: String, audience: Option<String>, skip: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            jwks_url,
            issuer,
            audience,
            skip,
            jwks_cache: RwLock::new(None),
        }
    }

    pub async fn verify(&self, headers: &HeaderMap) -> Result<()> {
        if self.skip {
            info!("Queue push auth skipped (debug mode)");
            return Ok(());
        }
        let audience = self
            .audience
            .as_deref()
            .context("Queue audience is not configured")?;

        let auth_header = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let token = auth_header
            .strip_prefix("Bearer ")
            .or_else(|| auth_header.strip_prefix("bearer "))
            .context("Missing queue bearer token")?;

        let header = decode_header(token).context("Malformed queue token header")?;
        let kid = header.kid.context("Queue token has no key id")?;

        let jwks = self.jwks(&kid).await?;
        let jwk = jwks
            .find(&kid)
            .with_context(|| format!("No JWKS key matches kid {kid}"))?;
        let key = DecodingKey::from_jwk(jwk).context("Unusable JWKS key")?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[&self.issuer]);

        let data =
            decode::<PushClaims>(token, &key, &validation).context("Queue token rejected")?;
        info!(
            audience,
            identity = data.claims.email.as_deref().unwrap_or("unknown"),
            "Queue push auth verified"
        );
        Ok(())
    }

    /// Cached JWKS, refetched when stale or when the wanted key is absent
    /// (key rotation).
    async fn jwks(&self, kid: &str) -> Result<JwkSet> {
        if let Some((fetched_at, ref set)) = *self.jwks_cache.read().await {
            if fetched_at.elapsed() < JWKS_CACHE_TTL && set.find(kid).is_some() {
                return Ok(set.clone());
            }
        }

        let set: JwkSet = self
            .client
            .get(&self.jwks_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("Failed to reach JWKS endpoint")?
            .error_for_status()
            .context("JWKS endpoint error")?
            .json()
            .await
            .context("Failed to parse JWKS document")?;

        *self.jwks_cache.write().await = Some((Instant::now(), set.clone()));
        Ok(set)
    }
}
