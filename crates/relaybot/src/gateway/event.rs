//! Normalization of dispatch frames into queue work items.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::api::ReplyTarget;

/// Which conversation surface a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// One-to-one chat with the bot.
    Direct,
    /// Group chat mention.
    Group,
    /// Guild channel mention.
    Channel,
}

/// A normalized inbound message, owned by the queue until dequeued.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub kind: InboundKind,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content: String,
    /// The platform message id; passive replies bind to this.
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub group_id: Option<String>,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl QueuedEvent {
    /// The send target a reply to this event goes to.
    pub fn reply_target(&self) -> ReplyTarget {
        match self.kind {
            InboundKind::Direct => ReplyTarget::Direct {
                open_id: self.sender_id.clone(),
            },
            InboundKind::Group => ReplyTarget::Group {
                group_open_id: self.group_id.clone().unwrap_or_default(),
            },
            InboundKind::Channel => ReplyTarget::Channel {
                channel_id: self.channel_id.clone().unwrap_or_default(),
            },
        }
    }
}

/// Map a dispatch event type to its conversation surface, if it is a
/// message-creation event at all.
fn kind_for(event_type: &str) -> Option<InboundKind> {
    match event_type {
        "C2C_MESSAGE_CREATE" => Some(InboundKind::Direct),
        "GROUP_AT_MESSAGE_CREATE" => Some(InboundKind::Group),
        "AT_MESSAGE_CREATE" => Some(InboundKind::Channel),
        _ => None,
    }
}

#[derive(Deserialize)]
struct RawMessage {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    author: RawAuthor,
    #[serde(default)]
    group_openid: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Deserialize)]
struct RawAuthor {
    id: String,
    #[serde(default)]
    username: Option<String>,
}

/// Translate a dispatch payload into a [`QueuedEvent`].
///
/// Returns `None` for event types that are not message creations and for
/// payloads missing required fields — the wire handler drops those rather
/// than failing the connection.
pub fn normalize(event_type: &str, data: &Value) -> Option<QueuedEvent> {
    let kind = kind_for(event_type)?;
    let raw: RawMessage = serde_json::from_value(data.clone()).ok()?;

    Some(QueuedEvent {
        kind,
        sender_id: raw.author.id,
        sender_name: raw.author.username,
        content: raw.content,
        event_id: raw.id,
        timestamp: raw.timestamp.unwrap_or_else(Utc::now),
        group_id: raw.group_openid,
        channel_id: raw.channel_id,
        guild_id: raw.guild_id,
        attachments: raw.attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c2c_message_normalizes() {
        let data = serde_json::json!({
            "id": "msg-1",
            "content": "hello bot",
            "timestamp": "2026-01-05T10:00:00Z",
            "author": {"id": "user-7", "username": "alice"},
        });

        let event = normalize("C2C_MESSAGE_CREATE", &data).unwrap();
        assert_eq!(event.kind, InboundKind::Direct);
        assert_eq!(event.sender_id, "user-7");
        assert_eq!(event.sender_name.as_deref(), Some("alice"));
        assert_eq!(event.content, "hello bot");
        assert_eq!(event.event_id, "msg-1");
        assert!(event.attachments.is_empty());
        assert_eq!(
            event.reply_target(),
            ReplyTarget::Direct {
                open_id: "user-7".into()
            }
        );
    }

    #[test]
    fn group_message_carries_group_target() {
        let data = serde_json::json!({
            "id": "msg-2",
            "content": "@bot ping",
            "author": {"id": "user-8"},
            "group_openid": "grp-1",
        });

        let event = normalize("GROUP_AT_MESSAGE_CREATE", &data).unwrap();
        assert_eq!(event.kind, InboundKind::Group);
        assert_eq!(
            event.reply_target(),
            ReplyTarget::Group {
                group_open_id: "grp-1".into()
            }
        );
    }

    #[test]
    fn channel_message_carries_channel_target() {
        let data = serde_json::json!({
            "id": "msg-3",
            "content": "@bot hi",
            "author": {"id": "user-9"},
            "channel_id": "ch-4",
            "guild_id": "guild-2",
        });

        let event = normalize("AT_MESSAGE_CREATE", &data).unwrap();
        assert_eq!(event.kind, InboundKind::Channel);
        assert_eq!(event.guild_id.as_deref(), Some("guild-2"));
        assert_eq!(
            event.reply_target(),
            ReplyTarget::Channel {
                channel_id: "ch-4".into()
            }
        );
    }

    #[test]
    fn attachments_are_preserved() {
        let data = serde_json::json!({
            "id": "msg-4",
            "content": "",
            "author": {"id": "user-1"},
            "attachments": [
                {"url": "https://cdn.relay.example/a.png", "content_type": "image/png", "size": 1024},
            ],
        });

        let event = normalize("C2C_MESSAGE_CREATE", &data).unwrap();
        assert_eq!(event.attachments.len(), 1);
        assert_eq!(event.attachments[0].url, "https://cdn.relay.example/a.png");
        assert_eq!(event.attachments[0].size, Some(1024));
    }

    #[test]
    fn non_message_events_are_ignored() {
        let data = serde_json::json!({"id": "x", "author": {"id": "u"}});
        assert!(normalize("GUILD_MEMBER_ADD", &data).is_none());
        assert!(normalize("READY", &data).is_none());
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let data = serde_json::json!({"content": "no id or author"});
        assert!(normalize("C2C_MESSAGE_CREATE", &data).is_none());
    }
}
