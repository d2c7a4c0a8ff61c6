use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix used for the room id of a group conversation.
pub const GROUP_ROOM_PREFIX: &str = "group_";

pub fn group_room_id(group_id: Uuid) -> String {
    format!("{}{}", GROUP_ROOM_PREFIX, group_id)
}

/// One direction of the canonical 1:1 room lookup. Two rows share a `room_id`
/// so either participant resolves it with a single key lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRoom {
    pub room_id: String,
    pub participant_a: Uuid,
    pub participant_b: Uuid,
}

/// 1:1 delivery state. Only ever advances `Received -> Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Received,
    Delivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Delivered => "DELIVERED",
        }
    }

    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        next > *self
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(Self::Received),
            "DELIVERED" => Ok(Self::Delivered),
            other => Err(format!("unknown message status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Voice,
    #[serde(alias = "VIDEO_CIRCLE")]
    Video,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Voice => "VOICE",
            Self::Video => "VIDEO",
            Self::System => "SYSTEM",
        }
    }

    /// Kinds that carry a blob attachment.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Voice | Self::Video)
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(Self::Text),
            "IMAGE" => Ok(Self::Image),
            "VOICE" => Ok(Self::Voice),
            "VIDEO" | "VIDEO_CIRCLE" => Ok(Self::Video),
            "SYSTEM" => Ok(Self::System),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: String,
    pub sender_id: Uuid,
    pub sender_name: String,
    /// Set for 1:1 messages.
    pub recipient_id: Option<Uuid>,
    /// Set for group messages.
    pub group_id: Option<Uuid>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub kind: MessageKind,
    pub attachment_key: Option<String>,
    pub deleted_for: BTreeSet<Uuid>,
    pub read_by: BTreeSet<Uuid>,
}

impl Message {
    pub fn is_visible_to(&self, user_id: Uuid) -> bool {
        !self.deleted_for.contains(&user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub creator_id: Uuid,
    pub member_ids: BTreeSet<Uuid>,
    pub muted_by: BTreeSet<Uuid>,
    pub avatar_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.member_ids.contains(&user_id)
    }

    pub fn is_creator(&self, user_id: Uuid) -> bool {
        self.creator_id == user_id
    }

    pub fn is_muted_by(&self, user_id: Uuid) -> bool {
        self.muted_by.contains(&user_id)
    }
}

/// A group as listed for one member, with its most recent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOverview {
    #[serde(flatten)]
    pub group: Group,
    pub last_message: Option<Message>,
}

/// Encryption material a browser hands out with a push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    /// Base64url P-256 public key of the user agent.
    pub p256dh: String,
    /// Base64url 16-byte authentication secret.
    pub auth: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub user_id: Uuid,
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
}

impl PresenceStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// One page of a newest-first message listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub items: Vec<Message>,
    pub has_more: bool,
    pub next_page: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_advances_forward() {
        assert!(MessageStatus::Received.can_advance_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Received));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Delivered));
    }

    #[test]
    fn video_circle_is_accepted_as_video() {
        let kind: MessageKind = serde_json::from_str("\"VIDEO_CIRCLE\"").unwrap();
        assert_eq!(kind, MessageKind::Video);
        assert_eq!("VIDEO_CIRCLE".parse::<MessageKind>().unwrap(), MessageKind::Video);
    }
}
