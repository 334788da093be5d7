use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::runtime::ReplySettings;

/// One inbound event from the messaging platform. `update_id` is assigned by
/// the platform and serves as the end-to-end dedup key.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    #[serde(default)]
    pub video: Option<Video>,
    #[serde(default)]
    pub caption: Option<String>,
}

impl Message {
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn sender_id(&self) -> Option<i64> {
        self.from.as_ref().and_then(|u| u.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    /// Absent in rare platform payloads (channel posts, anonymous admins).
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    /// "private", "group", "supergroup" or "channel".
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl Chat {
    pub fn is_private(&self) -> bool {
        self.kind.as_deref() == Some("private")
    }
}

/// A substring annotation (mention, hashtag, ...). The pipeline only checks
/// for presence; offsets are never dereferenced.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: i64,
    pub length: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Video {
    pub file_id: String,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

/// A chat-history row as persisted by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub date: DateTime<Utc>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
}

/// Cheap statistical summary of recent chat text, recomputed per reply
/// attempt. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleProfile {
    pub average_length: f64,
    pub emoji_ratio: f64,
    pub common_words: Vec<String>,
    /// Reserved; always empty.
    pub topics: Vec<String>,
}

/// Everything one generation attempt needs, assembled fresh per attempt.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub chat_id: i64,
    /// Oldest first.
    pub recent_messages: Vec<StoredMessage>,
    pub style_profile: StyleProfile,
    pub settings: ReplySettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_update() {
        let json = r#"{
            "update_id": 42,
            "message": {
                "message_id": 7,
                "from": {"id": 100, "is_bot": false, "username": "alice", "first_name": "Alice"},
                "chat": {"id": -900, "type": "group"},
                "date": 1700000000,
                "text": "hello @bot",
                "entities": [{"type": "mention", "offset": 6, "length": 4}]
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        assert_eq!(update.update_id, 42);
        let msg = update.message.unwrap();
        assert_eq!(msg.message_id, 7);
        assert_eq!(msg.sender_id(), Some(100));
        assert_eq!(msg.text_or_empty(), "hello @bot");
        assert_eq!(msg.entities.len(), 1);
        assert_eq!(msg.entities[0].kind, "mention");
        assert_eq!(msg.date.timestamp(), 1_700_000_000);
        assert!(!msg.chat.is_private());
    }

    #[test]
    fn test_parse_update_without_message() {
        let update: Update = serde_json::from_str(r#"{"update_id": 1}"#).unwrap();
        assert!(update.message.is_none());
    }

    #[test]
    fn test_parse_message_without_sender_or_text() {
        let json = r#"{
            "update_id": 2,
            "message": {
                "message_id": 9,
                "chat": {"id": 5, "type": "private"},
                "date": 1700000001
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.message.unwrap();
        assert!(msg.from.is_none());
        assert_eq!(msg.sender_id(), None);
        assert_eq!(msg.text_or_empty(), "");
        assert!(msg.entities.is_empty());
        assert!(msg.chat.is_private());
    }

    #[test]
    fn test_parse_video_message() {
        let json = r#"{
            "update_id": 3,
            "message": {
                "message_id": 11,
                "from": {"id": 4, "is_bot": false},
                "chat": {"id": -900, "type": "group"},
                "date": 1700000002,
                "caption": "check this out",
                "video": {"file_id": "vid-abc", "duration": 14, "file_size": 123456}
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.message.unwrap();
        let video = msg.video.unwrap();
        assert_eq!(video.file_id, "vid-abc");
        assert_eq!(msg.caption.as_deref(), Some("check this out"));
        assert!(msg.text.is_none());
    }

    #[test]
    fn test_sender_id_none_when_user_has_no_id() {
        let json = r#"{
            "update_id": 4,
            "message": {
                "message_id": 12,
                "from": {"is_bot": true},
                "chat": {"id": 5},
                "date": 1700000003
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.message.unwrap();
        assert!(msg.from.as_ref().unwrap().is_bot);
        assert_eq!(msg.sender_id(), None);
    }
}
