use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info, Instrument};

use crate::auth::PushTokenVerifier;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::media::VideoPipeline;
use crate::queue::{PushEnvelope, QueuePublisher};
use crate::storage::BotStore;
use crate::telegram::TelegramClient;
use crate::trace::extract_trace_id;
use crate::webhook::{intake, IntakeError, IntakeOutcome};
use crate::worker;

/// Everything the handlers need, constructed once at startup and shared.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: BotStore,
    pub llm: Arc<LlmClient>,
    pub telegram: Arc<TelegramClient>,
    pub publisher: Arc<dyn QueuePublisher>,
    pub verifier: Arc<PushTokenVerifier>,
    pub media: Arc<VideoPipeline>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .route("/queue/push", post(queue_push))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Stage A endpoint: shared-secret check, then admission and queue handoff.
/// Ignored traffic is still a 200; the platform treats both the same.
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let secret = headers
        .get("x-telegram-bot-api-secret-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if secret != state.config.webhook_secret {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        );
    }

    let trace_id = extract_trace_id(&headers);
    let span = tracing::info_span!(
        "webhook",
        trace_id = trace_id.as_deref().unwrap_or_default()
    );
    let result = intake(
        &body,
        trace_id.as_deref(),
        &state.config,
        state.publisher.as_ref(),
    )
    .instrument(span)
    .await;

    match result {
        Ok(IntakeOutcome::Accepted) => (StatusCode::OK, Json(json!({"status": "accepted"}))),
        Ok(IntakeOutcome::Ignored) => (StatusCode::OK, Json(json!({"status": "ignored"}))),
        Err(IntakeError::BadJson) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_json"})),
        ),
        Err(IntakeError::Publish(e)) => {
            error!("Queue handoff failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "publish_failed"})),
            )
        }
    }
}

/// Stage B endpoint, driven by the queue's push delivery. Any 5xx here is
/// an instruction to the queue to redeliver later.
async fn queue_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Err(e) = state.verifier.verify(&headers).await {
        error!("Queue push auth failed: {e:#}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "unauthorized"})),
        );
    }

    let envelope: PushEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_envelope"})),
            )
        }
    };

    let queue_message_id = envelope.message.message_id.clone().unwrap_or_default();
    let trace_id = envelope
        .message
        .attributes
        .get("trace_id")
        .cloned()
        .unwrap_or_default();
    let span = tracing::info_span!("queue_push", queue_message_id, trace_id);

    async {
        let update = match envelope.decode_update() {
            Ok(update) => update,
            Err(e) => {
                // Poison payloads stay errors; dead-lettering is the queue's
                // configuration concern, not ours.
                error!("queue.message.failed: {e:#}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "bad_payload"})),
                );
            }
        };
        info!(
            update_id = update.update_id,
            publish_time = envelope.message.publish_time.as_deref().unwrap_or_default(),
            "queue.message.received"
        );

        match worker::process_update(&state, &update).await {
            Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
            Err(e) => {
                error!(update_id = update.update_id, "queue.message.failed: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "processing_failed"})),
                )
            }
        }
    }
    .instrument(span)
    .await
}
