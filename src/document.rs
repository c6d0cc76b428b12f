//! Typed message document and conversion from upstream updates
//!
//! The first thing done to any upstream message is projecting it into
//! [`MessageDocument`], the fixed-shape record the search engine stores.
//! Nothing outside this module touches the native client message type for
//! document construction.

use crate::utils::get_share_id;
use grammers_client::types::Peer;
use grammers_client::types::update::Message as UpdateMessage;
use grammers_tl_types as tl;
use serde::{Deserialize, Serialize};

/// Chat categories recognized by the search engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
    Bot,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Private => "PRIVATE",
            ChatType::Group => "GROUP",
            ChatType::Supergroup => "SUPERGROUP",
            ChatType::Channel => "CHANNEL",
            ChatType::Bot => "BOT",
        }
    }

    pub fn parse(s: &str) -> Option<ChatType> {
        match s.to_uppercase().as_str() {
            "PRIVATE" => Some(ChatType::Private),
            "GROUP" => Some(ChatType::Group),
            "SUPERGROUP" => Some(ChatType::Supergroup),
            "CHANNEL" => Some(ChatType::Channel),
            "BOT" => Some(ChatType::Bot),
            _ => None,
        }
    }

    pub fn is_group_like(&self) -> bool {
        matches!(self, ChatType::Group | ChatType::Supergroup)
    }
}

/// Chat descriptor stored with every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub username: String,
}

/// Sender descriptor stored with every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
}

impl SenderInfo {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if !name.is_empty() {
            name.to_string()
        } else if !self.username.is_empty() {
            self.username.clone()
        } else {
            "Unknown".to_string()
        }
    }
}

/// Message entity (mention or hashtag) with offset and length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: i32,
    pub length: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<EntityUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
}

/// The unit stored in the search engine, keyed by `"{chat_id}-{message_id}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDocument {
    pub id: String,
    pub message_id: i32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub caption: String,
    pub chat: ChatInfo,
    pub from_user: SenderInfo,
    /// Present for channel posts made in the chat's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_chat: Option<ChatInfo>,
    pub date: i64,
    pub timestamp: i64,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_at: i64,
}

impl MessageDocument {
    pub fn composite_id(chat_id: i64, message_id: i32) -> String {
        format!("{}-{}", chat_id, message_id)
    }

    /// Searchable body: the text, or the media caption when there is no text.
    pub fn display_text(&self) -> &str {
        if !self.text.is_empty() {
            &self.text
        } else {
            &self.caption
        }
    }

    /// Chat display name, best effort.
    pub fn chat_name(&self) -> String {
        if !self.chat.title.is_empty() {
            self.chat.title.clone()
        } else if !self.chat.username.is_empty() {
            self.chat.username.clone()
        } else {
            format!("Chat_{}", get_share_id(self.chat.id))
        }
    }

    /// Project an upstream update message into a document.
    ///
    /// `chat_title` comes from the session's dialog cache when available; the
    /// update itself does not carry the chat name.
    pub fn from_update(message: &UpdateMessage, chat_title: Option<&str>) -> Self {
        let chat_id = message.peer_id().bot_api_dialog_id();
        let msg_id = message.id();
        let timestamp = message.date().timestamp();

        let (from_user, sender_chat) = extract_sender(message, chat_id, chat_title);
        let kind = classify_chat(chat_id, &from_user, sender_chat.is_some());

        let body = message.text().to_string();
        let has_media = message.media().is_some();
        let (text, caption) = if has_media {
            (String::new(), body)
        } else {
            (body, String::new())
        };

        MessageDocument {
            id: Self::composite_id(chat_id, msg_id),
            message_id: msg_id,
            text,
            caption,
            chat: ChatInfo {
                id: chat_id,
                kind,
                title: chat_title.unwrap_or_default().to_string(),
                username: String::new(),
            },
            from_user,
            sender_chat,
            date: timestamp,
            timestamp,
            entities: extract_entities(message),
            is_deleted: false,
            deleted_at: 0,
        }
    }
}

/// Pull sender information out of the update.
///
/// Channel posts made in the chat's own name surface as a `sender_chat`
/// record with the sender user zeroed, matching the wire contract.
fn extract_sender(
    message: &UpdateMessage,
    chat_id: i64,
    chat_title: Option<&str>,
) -> (SenderInfo, Option<ChatInfo>) {
    match message.sender() {
        Some(Peer::User(user)) => (
            SenderInfo {
                id: user.id().bot_api_dialog_id(),
                is_bot: user.is_bot(),
                first_name: user.first_name().to_string(),
                last_name: user.last_name().unwrap_or_default().to_string(),
                username: user.username().unwrap_or_default().to_string(),
            },
            None,
        ),
        Some(peer) => {
            let id = peer.id().bot_api_dialog_id();
            let sender_chat = ChatInfo {
                id,
                kind: if id == chat_id {
                    ChatType::Channel
                } else {
                    ChatType::Supergroup
                },
                title: peer.name().unwrap_or_default().to_string(),
                username: String::new(),
            };
            (SenderInfo::default(), Some(sender_chat))
        }
        None => {
            let sender_chat = ChatInfo {
                id: chat_id,
                kind: ChatType::Channel,
                title: chat_title.unwrap_or_default().to_string(),
                username: String::new(),
            };
            (SenderInfo::default(), Some(sender_chat))
        }
    }
}

/// Derive the chat category from the bot-api dialog id shape.
///
/// Positive ids are private dialogs (BOT when the counterpart is a bot),
/// `-100`-prefixed ids are supergroups or channels, other negatives are
/// basic groups. A chat-sender on a `-100` id means the post was made in
/// the channel's name, so the dialog is a broadcast channel.
fn classify_chat(chat_id: i64, from_user: &SenderInfo, has_sender_chat: bool) -> ChatType {
    if chat_id > 0 {
        if from_user.is_bot {
            ChatType::Bot
        } else {
            ChatType::Private
        }
    } else if chat_id.abs() > 1_000_000_000_000 {
        if has_sender_chat {
            ChatType::Channel
        } else {
            ChatType::Supergroup
        }
    } else {
        ChatType::Group
    }
}

/// Extract mention and hashtag entities; other entity kinds are not indexed.
fn extract_entities(message: &UpdateMessage) -> Vec<Entity> {
    let Some(raw_entities) = message.fmt_entities() else {
        return Vec::new();
    };

    let mut entities = Vec::new();
    for raw in raw_entities {
        match raw {
            tl::enums::MessageEntity::Mention(e) => entities.push(Entity {
                kind: "MENTION".to_string(),
                offset: e.offset,
                length: e.length,
                user_id: None,
                user: None,
            }),
            tl::enums::MessageEntity::Hashtag(e) => entities.push(Entity {
                kind: "HASHTAG".to_string(),
                offset: e.offset,
                length: e.length,
                user_id: None,
                user: None,
            }),
            tl::enums::MessageEntity::MentionName(e) => entities.push(Entity {
                kind: "TEXT_MENTION".to_string(),
                offset: e.offset,
                length: e.length,
                user_id: Some(e.user_id),
                user: None,
            }),
            _ => {}
        }
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> MessageDocument {
        MessageDocument {
            id: MessageDocument::composite_id(-1001234567890, 42),
            message_id: 42,
            text: "hello world".to_string(),
            caption: String::new(),
            chat: ChatInfo {
                id: -1001234567890,
                kind: ChatType::Supergroup,
                title: "TUNA".to_string(),
                username: "tuna".to_string(),
            },
            from_user: SenderInfo {
                id: 7,
                is_bot: false,
                first_name: "Alice".to_string(),
                last_name: "Liddell".to_string(),
                username: "alice".to_string(),
            },
            sender_chat: None,
            date: 1_700_000_000,
            timestamp: 1_700_000_000,
            entities: vec![Entity {
                kind: "HASHTAG".to_string(),
                offset: 0,
                length: 5,
                user_id: None,
                user: None,
            }],
            is_deleted: false,
            deleted_at: 0,
        }
    }

    #[test]
    fn test_composite_id() {
        assert_eq!(MessageDocument::composite_id(-1001, 5), "-1001-5");
        assert_eq!(MessageDocument::composite_id(7, 1), "7-1");
    }

    #[test]
    fn test_wire_round_trip() {
        let doc = sample_doc();
        let json = serde_json::to_string(&doc).unwrap();
        let back: MessageDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn test_chat_type_wire_names() {
        let json = serde_json::to_string(&ChatType::Supergroup).unwrap();
        assert_eq!(json, "\"SUPERGROUP\"");
        assert_eq!(ChatType::parse("channel"), Some(ChatType::Channel));
        assert_eq!(ChatType::parse("nope"), None);
    }

    #[test]
    fn test_display_text_prefers_text() {
        let mut doc = sample_doc();
        assert_eq!(doc.display_text(), "hello world");
        doc.text.clear();
        doc.caption = "a caption".to_string();
        assert_eq!(doc.display_text(), "a caption");
    }

    #[test]
    fn test_sender_display_name_fallbacks() {
        let mut sender = SenderInfo {
            id: 1,
            first_name: "Alice".into(),
            last_name: String::new(),
            username: "alice".into(),
            is_bot: false,
        };
        assert_eq!(sender.display_name(), "Alice");
        sender.first_name.clear();
        assert_eq!(sender.display_name(), "alice");
        sender.username.clear();
        assert_eq!(sender.display_name(), "Unknown");
    }

    #[test]
    fn test_classify_chat() {
        let user = SenderInfo {
            id: 1,
            ..Default::default()
        };
        let bot = SenderInfo {
            id: 2,
            is_bot: true,
            ..Default::default()
        };
        assert_eq!(classify_chat(100, &user, false), ChatType::Private);
        assert_eq!(classify_chat(100, &bot, false), ChatType::Bot);
        assert_eq!(classify_chat(-4512, &user, false), ChatType::Group);
        assert_eq!(
            classify_chat(-1001234567890, &user, false),
            ChatType::Supergroup
        );
        assert_eq!(
            classify_chat(-1001234567890, &SenderInfo::default(), true),
            ChatType::Channel
        );
    }

    #[test]
    fn test_deserialize_tolerates_missing_optionals() {
        let json = serde_json::json!({
            "id": "7-1",
            "message_id": 1,
            "text": "alpha",
            "chat": {"id": 7, "type": "PRIVATE"},
            "from_user": {"id": 7},
            "date": 1,
            "timestamp": 1
        });
        let doc: MessageDocument = serde_json::from_value(json).unwrap();
        assert!(doc.caption.is_empty());
        assert!(doc.entities.is_empty());
        assert!(!doc.is_deleted);
        assert!(doc.sender_chat.is_none());
    }
}
