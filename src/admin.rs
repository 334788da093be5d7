use std::fmt::Display;

use anyhow::Result;
use tracing::info;

use crate::models::Message;
use crate::runtime::SettingsOverride;
use crate::storage::BotStore;
use crate::telegram::TelegramClient;

const HELP_TEXT: &str = "Commands:\n\
    /help - this list\n\
    /get_config - show effective configuration\n\
    /reset_config - drop all overrides\n\
    /set_reply_chance <0..1>\n\
    /set_cooldown <seconds>\n\
    /set_context_messages <n>\n\
    /set_history_limit <n>\n\
    /set_max_reply_sentences <n> (0 disables trimming)\n\
    /set_temperature <0..2>\n\
    /set_max_tokens <n>\n\
    /set_system_prompt <text>";

/// Whether this message is an operator command: private chat, configured
/// admin sender, slash-prefixed text. Anything else takes the normal
/// pipeline, admin or not.
pub fn is_admin_command(message: &Message, admin_user_id: Option<i64>) -> bool {
    let Some(admin_id) = admin_user_id else {
        return false;
    };
    message.chat.is_private()
        && message.sender_id() == Some(admin_id)
        && message.text_or_empty().starts_with('/')
}

/// Execute an operator command and reply with the result. Invalid values
/// answer with the validation message and leave stored state untouched.
/// A dispatch failure propagates; the caller marks the update processed
/// regardless.
pub async fn handle_command(
    message: &Message,
    bot_username: Option<&str>,
    store: &BotStore,
    telegram: &TelegramClient,
) -> Result<()> {
    let text = message.text_or_empty().trim();
    let (command_raw, arg) = match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    };

    let command = command_raw.trim_start_matches('/');
    // Accept the /command@botname form groups produce.
    let command = match command.split_once('@') {
        Some((name, suffix))
            if bot_username.is_some_and(|u| suffix.eq_ignore_ascii_case(u)) =>
        {
            name
        }
        _ => command,
    };

    info!(command, user_id = ?message.sender_id(), "Admin command");

    let reply = match command {
        "help" => HELP_TEXT.to_string(),
        "get_config" => render_config(store).await?,
        "reset_config" => {
            store.clear_overrides().await?;
            "Configuration reset to defaults.".to_string()
        }
        "set_reply_chance"
        | "set_cooldown"
        | "set_context_messages"
        | "set_history_limit"
        | "set_max_reply_sentences"
        | "set_temperature"
        | "set_max_tokens"
        | "set_system_prompt" => apply_setting(store, command, arg).await?,
        _ => "Unknown command. Use /help.".to_string(),
    };

    telegram.send_message(message.chat.id, &reply).await
}

/// Read-merge-write of one tunable. The validation error message goes back
/// to the operator verbatim; nothing is stored on rejection.
async fn apply_setting(store: &BotStore, command: &str, arg: &str) -> Result<String> {
    let mut overrides = store.get_overrides().await?;
    let (field, result) = match command {
        "set_reply_chance" => ("reply_chance", overrides.set_reply_chance(arg)),
        "set_cooldown" => ("cooldown_seconds", overrides.set_cooldown_seconds(arg)),
        "set_context_messages" => ("context_messages", overrides.set_context_messages(arg)),
        "set_history_limit" => ("history_limit", overrides.set_history_limit(arg)),
        "set_max_reply_sentences" => (
            "max_reply_sentences",
            overrides.set_max_reply_sentences(arg),
        ),
        "set_temperature" => ("model_temperature", overrides.set_model_temperature(arg)),
        "set_max_tokens" => ("max_tokens", overrides.set_max_tokens(arg)),
        "set_system_prompt" => ("system_prompt", overrides.set_system_prompt(arg)),
        _ => unreachable!("dispatched above"),
    };

    match result {
        Ok(()) => {
            store.put_overrides(&overrides).await?;
            Ok(format!("{field} set to {}", arg.trim()))
        }
        Err(e) => Ok(e.to_string()),
    }
}

async fn render_config(store: &BotStore) -> Result<String> {
    let overrides = store.get_overrides().await?;
    let effective = overrides.merged();

    fn line(name: &str, value: impl Display, overridden: bool) -> String {
        let marker = if overridden { " (override)" } else { "" };
        format!("{name}: {value}{marker}")
    }

    let lines = vec![
        "Effective configuration:".to_string(),
        line(
            "reply_chance",
            effective.reply_chance,
            overrides.reply_chance.is_some(),
        ),
        line(
            "cooldown_seconds",
            effective.cooldown_seconds,
            overrides.cooldown_seconds.is_some(),
        ),
        line(
            "context_messages",
            effective.context_messages,
            overrides.context_messages.is_some(),
        ),
        line(
            "history_limit",
            effective.history_limit,
            overrides.history_limit.is_some(),
        ),
        line(
            "max_reply_sentences",
            effective.max_reply_sentences,
            overrides.max_reply_sentences.is_some(),
        ),
        line(
            "model_temperature",
            effective.model_temperature,
            overrides.model_temperature.is_some(),
        ),
        line(
            "max_tokens",
            effective.max_tokens,
            overrides.max_tokens.is_some(),
        ),
        line(
            "system_prompt",
            &effective.system_prompt,
            overrides.system_prompt.is_some(),
        ),
    ];
    Ok(lines.join("\n"))
}
