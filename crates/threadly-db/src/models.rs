/// Database row types. These map directly to SQLite rows; conversions into
/// threadly-types models live alongside them.
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use threadly_types::models::{
    ConversationRoom, Group, Message, PushSubscription, SubscriptionKeys,
};

pub struct RoomRow {
    pub room_id: String,
    pub user_a: String,
    pub user_b: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
    pub content: String,
    pub kind: String,
    pub attachment_key: Option<String>,
    pub status: String,
    pub sent_at: String,
    pub deleted_for: Vec<String>,
    pub read_by: Vec<String>,
}

pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    pub avatar_key: Option<String>,
    pub created_at: String,
    pub member_ids: Vec<String>,
    pub muted_by: Vec<String>,
}

pub struct PushSubscriptionRow {
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

/// Fixed-width UTC timestamp so lexical order matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("corrupt timestamp '{}'", raw))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

fn parse_ids<'a>(raw: impl IntoIterator<Item = &'a String>) -> Result<std::collections::BTreeSet<Uuid>> {
    raw.into_iter().map(|id| parse_id(id)).collect()
}

impl TryFrom<RoomRow> for ConversationRoom {
    type Error = anyhow::Error;

    fn try_from(row: RoomRow) -> Result<Self> {
        Ok(ConversationRoom {
            participant_a: parse_id(&row.user_a)?,
            participant_b: parse_id(&row.user_b)?,
            room_id: row.room_id,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: parse_id(&row.id)?,
            sender_id: parse_id(&row.sender_id)?,
            recipient_id: row.recipient_id.as_deref().map(parse_id).transpose()?,
            group_id: row.group_id.as_deref().map(parse_id).transpose()?,
            sent_at: parse_timestamp(&row.sent_at)?,
            status: row.status.parse().map_err(|e: String| anyhow!(e))?,
            kind: row.kind.parse().map_err(|e: String| anyhow!(e))?,
            deleted_for: parse_ids(&row.deleted_for)?,
            read_by: parse_ids(&row.read_by)?,
            room_id: row.room_id,
            sender_name: row.sender_name,
            content: row.content,
            attachment_key: row.attachment_key,
        })
    }
}

impl TryFrom<GroupRow> for Group {
    type Error = anyhow::Error;

    fn try_from(row: GroupRow) -> Result<Self> {
        Ok(Group {
            id: parse_id(&row.id)?,
            creator_id: parse_id(&row.creator_id)?,
            created_at: parse_timestamp(&row.created_at)?,
            member_ids: parse_ids(&row.member_ids)?,
            muted_by: parse_ids(&row.muted_by)?,
            name: row.name,
            avatar_key: row.avatar_key,
        })
    }
}

impl TryFrom<PushSubscriptionRow> for PushSubscription {
    type Error = anyhow::Error;

    fn try_from(row: PushSubscriptionRow) -> Result<Self> {
        Ok(PushSubscription {
            user_id: parse_id(&row.user_id)?,
            endpoint: row.endpoint,
            keys: SubscriptionKeys {
                p256dh: row.p256dh,
                auth: row.auth,
            },
        })
    }
}
