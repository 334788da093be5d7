use anyhow::Result;
use chrono::Utc;
use tracing::{error, info};

use crate::admin;
use crate::models::{Message, ReplyContext, StoredMessage, Video};
use crate::policy;
use crate::runtime::ReplySettings;
use crate::server::AppState;
use crate::style::build_style_profile;

/// What a reply attempt came to. The orchestrator only inspects this for
/// logging: every variant still ends with the update marked processed, so
/// dedup correctness never hangs on reply delivery.
pub enum ReplyOutcome {
    Sent,
    Suppressed,
    Empty,
    Failed(anyhow::Error),
}

/// Stage B of the pipeline, invoked per queue delivery. Dedup runs before
/// any side effect, which is what makes redelivery of the same update safe.
/// Errors returned from here become a retryable delivery failure.
pub async fn process_update(state: &AppState, update: &crate::models::Update) -> Result<()> {
    let update_id = update.update_id;
    let Some(message) = update.message.as_ref() else {
        // Intake filters these; a queue can still replay old traffic.
        state.store.mark_processed(update_id).await?;
        return Ok(());
    };
    let chat_id = message.chat.id;
    let message_id = message.message_id;

    if state.store.has_processed(update_id).await? {
        info!(update_id, chat_id, message_id, "update.duplicate");
        return Ok(());
    }

    if admin::is_admin_command(message, state.config.admin_user_id) {
        // Admin traffic never touches chat history. The processed marker is
        // written before a dispatch failure is allowed to propagate.
        let result = admin::handle_command(
            message,
            state.config.bot_username.as_deref(),
            &state.store,
            &state.telegram,
        )
        .await;
        state.store.mark_processed(update_id).await?;
        info!(update_id, chat_id, "update.processed");
        return result;
    }

    // Persist before deciding: a message contributes to history and future
    // style profiles even when no reply follows.
    let record = StoredMessage {
        message_id,
        text: message.text.clone(),
        date: message.date,
        user_id: message.sender_id(),
        username: message.from.as_ref().and_then(|u| u.username.clone()),
    };
    state.store.append_message(chat_id, &record).await?;
    info!(update_id, chat_id, message_id, "message.saved");

    if let Some(video) = message.video.as_ref() {
        if let Err(e) = handle_video(state, message, video).await {
            error!(update_id, chat_id, message_id, "video.failed: {e:#}");
        }
        state.store.mark_processed(update_id).await?;
        info!(update_id, chat_id, "update.processed");
        return Ok(());
    }

    let outcome = match attempt_reply(state, message).await {
        Ok(outcome) => outcome,
        Err(e) => ReplyOutcome::Failed(e),
    };
    match &outcome {
        ReplyOutcome::Sent => info!(
            update_id,
            chat_id,
            reply_chat_id = state.config.reply_chat_id,
            "reply.sent"
        ),
        ReplyOutcome::Suppressed => {}
        ReplyOutcome::Empty => info!(update_id, chat_id, "reply.empty"),
        ReplyOutcome::Failed(e) => error!(update_id, chat_id, "reply.failed: {e:#}"),
    }

    state.store.mark_processed(update_id).await?;
    info!(update_id, chat_id, "update.processed");
    Ok(())
}

async fn attempt_reply(state: &AppState, message: &Message) -> Result<ReplyOutcome> {
    let settings = state.store.get_overrides().await?.merged();
    let last_reply = state
        .store
        .latest_reply_time(state.config.reply_chat_id)
        .await?;
    let decision = policy::should_reply(
        message,
        state.config.bot_username.as_deref(),
        state.config.bot_user_id,
        &settings,
        last_reply,
        Utc::now(),
        rand::random::<f64>(),
    );
    info!(
        message_id = message.message_id,
        chat_id = message.chat.id,
        should_reply = decision,
        "reply.decision"
    );
    if !decision {
        return Ok(ReplyOutcome::Suppressed);
    }

    let context = build_context(state, message.chat.id, settings).await?;
    let reply = state.llm.generate_reply(&context).await?;
    if reply.is_empty() {
        return Ok(ReplyOutcome::Empty);
    }

    state
        .telegram
        .send_message(state.config.reply_chat_id, &reply)
        .await?;
    state
        .store
        .append_reply(state.config.reply_chat_id, message.message_id, &reply)
        .await?;
    Ok(ReplyOutcome::Sent)
}

/// Style profile from the full history window, generation context from the
/// most recent slice of it, oldest first.
async fn build_context(
    state: &AppState,
    chat_id: i64,
    settings: ReplySettings,
) -> Result<ReplyContext> {
    let history = state
        .store
        .latest_messages(chat_id, settings.history_limit)
        .await?;
    let style_profile = build_style_profile(&history);
    let mut recent_messages: Vec<StoredMessage> = history
        .into_iter()
        .take(settings.context_messages)
        .collect();
    recent_messages.reverse();
    Ok(ReplyContext {
        chat_id,
        recent_messages,
        style_profile,
        settings,
    })
}

/// Video branch: media URL → frames → vision summary → style-matched
/// comment, dispatched and stored like any reply. Failures are the caller's
/// to log; they never block the processed marker.
async fn handle_video(state: &AppState, message: &Message, video: &Video) -> Result<()> {
    info!(
        chat_id = message.chat.id,
        file_id = video.file_id,
        "video.received"
    );

    let url = state.telegram.get_file_url(&video.file_id).await?;
    let frames = state.media.frames_from_url(&url).await?;
    if frames.is_empty() {
        info!(chat_id = message.chat.id, "video.no_frames");
        return Ok(());
    }

    let analysis = state
        .llm
        .describe_frames(&frames, message.caption.as_deref())
        .await?;
    if analysis.is_empty() {
        info!(chat_id = message.chat.id, "video.analysis_empty");
        return Ok(());
    }

    let settings = state.store.get_overrides().await?.merged();
    let context = build_context(state, message.chat.id, settings).await?;
    let comment = state.llm.video_comment(&analysis, &context).await?;
    if comment.is_empty() {
        info!(chat_id = message.chat.id, "reply.empty");
        return Ok(());
    }

    state
        .telegram
        .send_message(state.config.reply_chat_id, &comment)
        .await?;
    state
        .store
        .append_reply(state.config.reply_chat_id, message.message_id, &comment)
        .await?;
    info!(
        chat_id = message.chat.id,
        reply_chat_id = state.config.reply_chat_id,
        "video.reply_sent"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PushTokenVerifier;
    use crate::config::Config;
    use crate::llm::LlmClient;
    use crate::media::VideoPipeline;
    use crate::models::Update;
    use crate::queue::HttpQueuePublisher;
    use crate::storage::BotStore;
    use crate::telegram::TelegramClient;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        state: AppState,
        llm_server: MockServer,
        telegram_server: MockServer,
    }

    async fn harness() -> Harness {
        let llm_server = MockServer::start().await;
        let telegram_server = MockServer::start().await;

        let config = Arc::new(Config {
            project_id: "proj".to_string(),
            ingest_chat_id: -100,
            reply_chat_id: -100,
            queue_topic: "unused".to_string(),
            queue_audience: None,
            queue_token: None,
            queue_issuer: "iss".to_string(),
            queue_jwks_url: "jwks".to_string(),
            telegram_token: "t".to_string(),
            openai_key: "k".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            openai_vision_model: "gpt-4o".to_string(),
            webhook_secret: "s".to_string(),
            log_level: "info".to_string(),
            database_path: "unused.db".into(),
            bot_username: Some("banterbot".to_string()),
            bot_user_id: Some(999),
            admin_user_id: Some(42),
            media_token: None,
            skip_queue_auth: true,
            port: 8080,
        });

        let state = AppState {
            config: config.clone(),
            store: BotStore::open_in_memory().unwrap(),
            llm: Arc::new(
                LlmClient::new(
                    "k".to_string(),
                    "gpt-4o-mini".to_string(),
                    "gpt-4o".to_string(),
                )
                .with_base_url(llm_server.uri()),
            ),
            telegram: Arc::new(
                TelegramClient::new("t".to_string()).with_api_base(telegram_server.uri()),
            ),
            publisher: Arc::new(HttpQueuePublisher::new("http://127.0.0.1:1".to_string(), None)),
            verifier: Arc::new(PushTokenVerifier::new(
                "http://127.0.0.1:1".to_string(),
                "iss".to_string(),
                None,
                true,
            )),
            media: Arc::new(VideoPipeline::new(None)),
        };

        Harness {
            state,
            llm_server,
            telegram_server,
        }
    }

    async fn mock_llm(server: &MockServer, reply: &str, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": reply}}]
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    async fn mock_telegram(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/bott/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"ok": true, "result": {"message_id": 1}}),
            ))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn question_update(update_id: i64) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": 11,
                "from": {"id": 5, "is_bot": false, "username": "alice"},
                "chat": {"id": -100, "type": "group"},
                "date": 1700000000,
                "text": "hi?"
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_question_message_gets_reply_dispatched_and_stored() {
        let h = harness().await;
        mock_llm(&h.llm_server, "Hey! 😊", 1).await;
        mock_telegram(&h.telegram_server, 1).await;

        process_update(&h.state, &question_update(1)).await.unwrap();

        assert!(h.state.store.has_processed(1).await.unwrap());
        let history = h.state.store.latest_messages(-100, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text.as_deref(), Some("hi?"));
        assert!(h.state.store.latest_reply_time(-100).await.unwrap().is_some());

        // Generation saw a system turn plus the stored message as a user turn.
        let llm_requests = h.llm_server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&llm_requests[0].body).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "hi?");

        // The dispatched text is the generated reply.
        let tg_requests = h.telegram_server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&tg_requests[0].body).unwrap();
        assert_eq!(body["text"], "Hey! 😊");
        assert_eq!(body["chat_id"], -100);
    }

    #[tokio::test]
    async fn test_redelivery_is_a_no_op() {
        let h = harness().await;
        mock_llm(&h.llm_server, "Hello!", 1).await;
        mock_telegram(&h.telegram_server, 1).await;

        let update = question_update(2);
        process_update(&h.state, &update).await.unwrap();
        process_update(&h.state, &update).await.unwrap();

        // Exactly one stored message and one stored reply; the mock expect()
        // counts above assert exactly one generation and one dispatch.
        assert_eq!(h.state.store.latest_messages(-100, 10).await.unwrap().len(), 1);
        assert!(h.state.store.has_processed(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_reply_path_still_marks_processed() {
        let h = harness().await;
        // reply_chance 0 and no question mark: policy says no.
        let mut overrides = crate::runtime::SettingsOverride::default();
        overrides.set_reply_chance("0").unwrap();
        h.state.store.put_overrides(&overrides).await.unwrap();

        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 3,
            "message": {
                "message_id": 12,
                "from": {"id": 5, "is_bot": false},
                "chat": {"id": -100, "type": "group"},
                "date": 1700000000,
                "text": "plain chatter"
            }
        }))
        .unwrap();
        process_update(&h.state, &update).await.unwrap();

        assert!(h.state.store.has_processed(3).await.unwrap());
        assert_eq!(h.state.store.latest_messages(-100, 10).await.unwrap().len(), 1);
        assert!(h.state.store.latest_reply_time(-100).await.unwrap().is_none());
        assert!(h.llm_server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_command_skips_history_and_marks_processed() {
        let h = harness().await;
        mock_telegram(&h.telegram_server, 1).await;

        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 4,
            "message": {
                "message_id": 13,
                "from": {"id": 42, "is_bot": false, "username": "op"},
                "chat": {"id": 42, "type": "private"},
                "date": 1700000000,
                "text": "/set_cooldown abc"
            }
        }))
        .unwrap();
        process_update(&h.state, &update).await.unwrap();

        assert!(h.state.store.has_processed(4).await.unwrap());
        // No history entry for admin traffic, no override stored.
        assert!(h.state.store.latest_messages(42, 10).await.unwrap().is_empty());
        assert!(h.state.store.get_overrides().await.unwrap().is_empty());

        let tg_requests = h.telegram_server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&tg_requests[0].body).unwrap();
        assert_eq!(body["text"], "cooldown_seconds expects a non-negative integer");
    }

    #[tokio::test]
    async fn test_admin_text_without_slash_takes_normal_pipeline() {
        let h = harness().await;
        mock_llm(&h.llm_server, "Sure!", 1).await;
        mock_telegram(&h.telegram_server, 1).await;

        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 5,
            "message": {
                "message_id": 14,
                "from": {"id": 42, "is_bot": false, "username": "op"},
                "chat": {"id": 42, "type": "private"},
                "date": 1700000000,
                "text": "you there?"
            }
        }))
        .unwrap();
        process_update(&h.state, &update).await.unwrap();

        assert_eq!(h.state.store.latest_messages(42, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_generation_exhaustion_sends_nothing_but_processes() {
        let h = harness().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&h.llm_server)
            .await;
        mock_telegram(&h.telegram_server, 0).await;

        process_update(&h.state, &question_update(6)).await.unwrap();

        assert!(h.state.store.has_processed(6).await.unwrap());
        assert!(h.state.store.latest_reply_time(-100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_failure_still_marks_processed() {
        let h = harness().await;
        mock_llm(&h.llm_server, "Hi!", 1).await;
        Mock::given(method("POST"))
            .and(path("/bott/sendMessage"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&h.telegram_server)
            .await;

        process_update(&h.state, &question_update(7)).await.unwrap();

        assert!(h.state.store.has_processed(7).await.unwrap());
        assert!(h.state.store.latest_reply_time(-100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_without_message_is_marked_processed() {
        let h = harness().await;
        let update: Update = serde_json::from_value(serde_json::json!({"update_id": 8})).unwrap();
        process_update(&h.state, &update).await.unwrap();
        assert!(h.state.store.has_processed(8).await.unwrap());
    }

    #[tokio::test]
    async fn test_cooldown_reads_reply_chat_history() {
        let h = harness().await;
        // A very recent reply is on record; plain text in cooldown → no call.
        h.state.store.append_reply(-100, 99, "earlier").await.unwrap();

        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 9,
            "message": {
                "message_id": 15,
                "from": {"id": 5, "is_bot": false},
                "chat": {"id": -100, "type": "group"},
                "date": 1700000000,
                "text": "plain chatter"
            }
        }))
        .unwrap();
        process_update(&h.state, &update).await.unwrap();

        assert!(h.state.store.has_processed(9).await.unwrap());
        assert!(h.llm_server.received_requests().await.unwrap().is_empty());
    }
}
