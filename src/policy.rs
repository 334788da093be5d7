use chrono::{DateTime, Utc};

use crate::models::Message;
use crate::runtime::ReplySettings;

/// Decide whether a reply should be attempted. Pure: the clock, the last
/// reply time, and the random draw are all passed in.
///
/// Precedence, short-circuit:
/// 1. bot sender, unknown sender, or the bot itself never gets a reply;
/// 2. an explicit @mention or a question mark always does, cooldown or not;
/// 3. inside the cooldown window the probabilistic path is suppressed;
/// 4. otherwise reply iff `roll < reply_chance`.
pub fn should_reply(
    message: &Message,
    bot_username: Option<&str>,
    bot_user_id: Option<i64>,
    settings: &ReplySettings,
    last_reply_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    roll: f64,
) -> bool {
    let Some(sender) = message.from.as_ref() else {
        return false;
    };
    if sender.is_bot {
        return false;
    }
    let Some(sender_id) = sender.id else {
        return false;
    };
    if bot_user_id == Some(sender_id) {
        return false;
    }

    let text = message.text_or_empty();
    if let Some(username) = bot_username {
        if text.contains(&format!("@{username}")) {
            return true;
        }
    }
    if text.contains('?') {
        return true;
    }

    if let Some(last) = last_reply_at {
        let elapsed = (now - last).num_seconds();
        if elapsed >= 0 && (elapsed as u64) < settings.cooldown_seconds {
            return false;
        }
    }

    roll < settings.reply_chance
}
