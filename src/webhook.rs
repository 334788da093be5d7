use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::models::Update;
use crate::queue::QueuePublisher;
use crate::trace::build_trace_fields;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid JSON body")]
    BadJson,
    #[error("queue publish failed: {0}")]
    Publish(#[source] anyhow::Error),
}

#[derive(Debug, PartialEq)]
pub enum IntakeOutcome {
    /// Published to the queue; the platform may stop redelivering.
    Accepted,
    /// Filtered out. Still a success to the caller: ignoring is not an error.
    Ignored,
}

/// Stage A of the pipeline: parse, admission-filter, and hand off to the
/// durable queue. The raw body is republished verbatim so the worker sees
/// exactly what the platform sent.
pub async fn intake(
    body: &[u8],
    trace_id: Option<&str>,
    config: &Config,
    publisher: &dyn QueuePublisher,
) -> Result<IntakeOutcome, IntakeError> {
    let update: Update = serde_json::from_slice(body).map_err(|_| IntakeError::BadJson)?;

    if let Some(reason) = admission_reason(&update, config) {
        debug!(update_id = update.update_id, reason, "Update ignored");
        return Ok(IntakeOutcome::Ignored);
    }

    let attributes: HashMap<String, String> = build_trace_fields(trace_id, &config.project_id);
    let message_id = publisher
        .publish(body, attributes)
        .await
        .map_err(IntakeError::Publish)?;
    info!(
        update_id = update.update_id,
        queue_message_id = message_id,
        "Update accepted"
    );
    Ok(IntakeOutcome::Accepted)
}

/// Cheap synchronous checks deciding whether an update is worth queuing.
/// Returns the reason to drop it, or None to admit.
fn admission_reason(update: &Update, config: &Config) -> Option<&'static str> {
    let Some(message) = update.message.as_ref() else {
        return Some("no message");
    };
    let Some(sender) = message.from.as_ref() else {
        return Some("no sender");
    };
    if sender.is_bot {
        return Some("bot sender");
    }
    if config.bot_user_id.is_some() && sender.id == config.bot_user_id {
        return Some("own message");
    }

    let admin_dm = message.chat.is_private()
        && config.admin_user_id.is_some()
        && sender.id == config.admin_user_id;
    if message.chat.id != config.ingest_chat_id && !admin_dm {
        return Some("chat not allowed");
    }
    None
}
