use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Group, Message, PresenceStatus};

/// Events sent over the live channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LiveEvent {
    /// Server confirms the connection is authenticated
    Ready { user_id: Uuid, username: String },

    /// A 1:1 message was stored for the recipient. Carries metadata only;
    /// clients fetch the body lazily.
    MessageNotification {
        id: Uuid,
        sender_id: Uuid,
        sender_name: String,
    },

    /// Echo of a stored message back to its sender
    SentAck(Message),

    /// The recipient opened the conversation and messages moved to DELIVERED
    ReadReceipt { reader_id: Uuid },

    /// Group created or its membership/name/avatar changed
    GroupUpdate(Group),

    /// Group was deleted by its creator
    GroupDeleted { id: Uuid },

    /// Full group message fanned out to a member
    GroupMessage(Message),

    /// A user came online or went offline
    PresenceUpdate { user_id: Uuid, status: PresenceStatus },

    /// A user started typing to another user or group
    TypingStart {
        user_id: Uuid,
        username: String,
        target_id: Uuid,
    },

    /// A user changed their avatar. Sent to every connection.
    AvatarUpdated { user_id: Uuid, avatar_url: String },
}

impl LiveEvent {
    /// Name of the logical channel this event travels on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::MessageNotification { .. } => "messages",
            Self::SentAck(_) => "sent-ack",
            Self::ReadReceipt { .. } => "read-receipts",
            Self::GroupUpdate(_) | Self::GroupDeleted { .. } => "group-update",
            Self::GroupMessage(_) => "group-messages",
            Self::PresenceUpdate { .. } => "status",
            Self::TypingStart { .. } => "typing",
            Self::AvatarUpdated { .. } => "avatar-updated",
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LiveCommand {
    /// Keep the presence entry alive
    Heartbeat,

    /// Indicate typing towards a user or group member
    StartTyping { target_id: Uuid },
}
