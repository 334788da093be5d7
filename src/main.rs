use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod admin;
mod auth;
mod config;
mod llm;
mod media;
mod models;
mod policy;
mod queue;
mod runtime;
mod secrets;
mod server;
mod storage;
mod style;
mod telegram;
mod trace;
mod webhook;
mod worker;

use crate::auth::PushTokenVerifier;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::media::VideoPipeline;
use crate::queue::HttpQueuePublisher;
use crate::secrets::{PassthroughResolver, RestSecretResolver, SecretResolver};
use crate::server::AppState;
use crate::storage::BotStore;
use crate::telegram::TelegramClient;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!("{level},banterbot=debug"))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let resolver: Box<dyn SecretResolver> = match std::env::var("SECRET_STORE_URL") {
        Ok(url) if !url.is_empty() => Box::new(RestSecretResolver::new(
            url,
            std::env::var("SECRET_STORE_TOKEN").ok().filter(|t| !t.is_empty()),
        )),
        _ => Box::new(PassthroughResolver),
    };
    let config = Arc::new(Config::from_env(resolver.as_ref()).await?);

    let store = BotStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database at {:?}", config.database_path))?;

    let state = AppState {
        config: config.clone(),
        store,
        llm: Arc::new(LlmClient::new(
            config.openai_key.clone(),
            config.openai_model.clone(),
            config.openai_vision_model.clone(),
        )),
        telegram: Arc::new(TelegramClient::new(config.telegram_token.clone())),
        publisher: Arc::new(HttpQueuePublisher::new(
            config.queue_topic.clone(),
            config.queue_token.clone(),
        )),
        verifier: Arc::new(PushTokenVerifier::new(
            config.queue_jwks_url.clone(),
            config.queue_issuer.clone(),
            config.queue_audience.clone(),
            config.skip_queue_auth,
        )),
        media: Arc::new(VideoPipeline::new(config.media_token.clone())),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!(port = config.port, chat_id = config.ingest_chat_id, "Listening");

    axum::serve(listener, server::app(state))
        .await
        .context("Server error")?;
    Ok(())
}
