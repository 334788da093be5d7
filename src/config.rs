use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::secrets::SecretResolver;

const DEFAULT_QUEUE_ISSUER: &str = "https://accounts.google.com";
const DEFAULT_QUEUE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// Environment-driven service configuration, constructed once at process
/// start and handed by reference to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_id: String,
    pub ingest_chat_id: i64,
    /// Where replies go; defaults to the ingest chat.
    pub reply_chat_id: i64,
    /// Publish URL of the durable queue topic.
    pub queue_topic: String,
    pub queue_audience: Option<String>,
    pub queue_token: Option<String>,
    pub queue_issuer: String,
    pub queue_jwks_url: String,
    pub telegram_token: String,
    pub openai_key: String,
    pub openai_model: String,
    pub openai_vision_model: String,
    pub webhook_secret: String,
    pub log_level: String,
    pub database_path: PathBuf,
    pub bot_username: Option<String>,
    pub bot_user_id: Option<i64>,
    pub admin_user_id: Option<i64>,
    pub media_token: Option<String>,
    pub skip_queue_auth: bool,
    pub port: u16,
}

impl Config {
    pub async fn from_env(resolver: &dyn SecretResolver) -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok(), resolver).await
    }

    /// Build from an injected lookup so tests never touch process env.
    /// Credential-bearing values go through the secret resolver.
    pub async fn from_lookup<F>(lookup: F, resolver: &dyn SecretResolver) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &str| -> Result<String> {
            lookup(name)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("Missing required environment variable: {name}"))
        };
        let optional = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let parse_id = |name: &str, value: String| -> Result<i64> {
            value
                .parse()
                .with_context(|| format!("{name} is not a valid integer: {value}"))
        };

        let ingest_chat_id = parse_id("CHAT_ID", require("CHAT_ID")?)?;
        let reply_chat_id = match optional("REPLY_CHAT_ID") {
            Some(v) => parse_id("REPLY_CHAT_ID", v)?,
            None => ingest_chat_id,
        };
        let bot_user_id = optional("BOT_USER_ID")
            .map(|v| parse_id("BOT_USER_ID", v))
            .transpose()?;
        let admin_user_id = optional("ADMIN_USER_ID")
            .map(|v| parse_id("ADMIN_USER_ID", v))
            .transpose()?;
        let port = match optional("PORT") {
            Some(v) => v
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {v}"))?,
            None => 8080,
        };

        let telegram_token = resolver.resolve(&require("TG_TOKEN")?).await?;
        let openai_key = resolver.resolve(&require("OPENAI_KEY")?).await?;
        let webhook_secret = resolver.resolve(&require("WEBHOOK_SECRET")?).await?;
        let media_token = match optional("MEDIA_TOKEN") {
            Some(v) => Some(resolver.resolve(&v).await?),
            None => None,
        };

        Ok(Self {
            project_id: require("PROJECT_ID")?,
            ingest_chat_id,
            reply_chat_id,
            queue_topic: require("QUEUE_TOPIC")?,
            queue_audience: optional("QUEUE_AUDIENCE"),
            queue_token: optional("QUEUE_TOKEN"),
            queue_issuer: optional("QUEUE_ISSUER")
                .unwrap_or_else(|| DEFAULT_QUEUE_ISSUER.to_string()),
            queue_jwks_url: optional("QUEUE_JWKS_URL")
                .unwrap_or_else(|| DEFAULT_QUEUE_JWKS_URL.to_string()),
            telegram_token,
            openai_key,
            openai_model: optional("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openai_vision_model: optional("OPENAI_VISION_MODEL")
                .unwrap_or_else(|| "gpt-4o".to_string()),
            webhook_secret,
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            database_path: optional("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("banterbot.db")),
            bot_username: optional("BOT_USERNAME").map(|u| u.trim_start_matches('@').to_string()),
            bot_user_id,
            admin_user_id,
            media_token,
            skip_queue_auth: optional("SKIP_QUEUE_AUTH")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            port,
        })
    }
}
