use std::collections::HashMap;

use anyhow::Result;
use rusqlite::types::ToSql;
use rusqlite::{Connection, Transaction};

use threadly_types::models::{
    ConversationRoom, Group, Message, MessageKind, MessageStatus, PushSubscription,
};

use crate::Database;
use crate::models::{
    GroupRow, MessageRow, PushSubscriptionRow, RoomRow, format_timestamp,
};

const MESSAGE_COLUMNS: &str = "m.id, m.room_id, m.sender_id, m.sender_name, m.recipient_id, \
     m.group_id, m.content, m.kind, m.attachment_key, m.status, m.sent_at";

/// Filter for listing the messages of one room.
#[derive(Debug, Clone, Default)]
pub struct RoomQuery<'a> {
    pub room_id: &'a str,
    /// Skip messages this user has soft-deleted.
    pub hidden_for: Option<&'a str>,
    pub kind: Option<MessageKind>,
    pub newest_first: bool,
    pub offset: u32,
    pub limit: Option<u32>,
}

impl Database {
    // -- Rooms --

    pub fn find_room(&self, user_a: &str, user_b: &str) -> Result<Option<ConversationRoom>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT room_id, user_a, user_b FROM rooms WHERE user_a = ?1 AND user_b = ?2",
                (user_a, user_b),
                map_room_row,
            )
            .optional()?
            .map(ConversationRoom::try_from)
            .transpose()
        })
    }

    /// Insert both lookup directions for a new room. Existing rows win, so a
    /// concurrent creator's id is kept.
    pub fn insert_room_pair(&self, room_id: &str, user_a: &str, user_b: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO rooms (user_a, user_b, room_id) VALUES (?1, ?2, ?3)",
                (user_a, user_b, room_id),
            )?;
            if user_a != user_b {
                tx.execute(
                    "INSERT OR IGNORE INTO rooms (user_a, user_b, room_id) VALUES (?1, ?2, ?3)",
                    (user_b, user_a, room_id),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn count_room_rows(&self, room_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM rooms WHERE room_id = ?1", [room_id], |row| {
                    row.get(0)
                })?;
            Ok(count as u64)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            insert_message_tx(&tx, message)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM messages m WHERE m.id = ?1", MESSAGE_COLUMNS);
            let row = conn.query_row(&sql, [id], map_message_row).optional()?;
            match row {
                Some(row) => {
                    let mut rows = vec![row];
                    load_message_sets(conn, &mut rows)?;
                    rows.pop().map(Message::try_from).transpose()
                }
                None => Ok(None),
            }
        })
    }

    pub fn room_messages(&self, query: &RoomQuery<'_>) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut rows = query_room_messages(conn, query)?;
            load_message_sets(conn, &mut rows)?;
            rows.into_iter().map(Message::try_from).collect()
        })
    }

    pub fn latest_room_message(&self, room_id: &str) -> Result<Option<Message>> {
        let mut page = self.room_messages(&RoomQuery {
            room_id,
            newest_first: true,
            limit: Some(1),
            ..Default::default()
        })?;
        Ok(page.pop())
    }

    /// Advance RECEIVED messages from `sender_id` to `recipient_id` in a room
    /// to DELIVERED, skipping ones the recipient deleted. Returns rows changed.
    pub fn mark_room_delivered(
        &self,
        room_id: &str,
        sender_id: &str,
        recipient_id: &str,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?4
                 WHERE room_id = ?1 AND sender_id = ?2 AND recipient_id = ?3 AND status = ?5
                   AND NOT EXISTS (
                       SELECT 1 FROM message_deletions d
                       WHERE d.message_id = messages.id AND d.user_id = ?3
                   )",
                (
                    room_id,
                    sender_id,
                    recipient_id,
                    MessageStatus::Delivered.as_str(),
                    MessageStatus::Received.as_str(),
                ),
            )?;
            Ok(changed)
        })
    }

    /// Advance a single message to DELIVERED. Returns false if it was not RECEIVED.
    pub fn mark_message_delivered(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1 AND status = ?3",
                (
                    id,
                    MessageStatus::Delivered.as_str(),
                    MessageStatus::Received.as_str(),
                ),
            )?;
            Ok(changed > 0)
        })
    }

    /// Soft-delete every message of a room for one user.
    pub fn hide_room_for_user(&self, room_id: &str, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO message_deletions (message_id, user_id)
                 SELECT id, ?2 FROM messages WHERE room_id = ?1",
                (room_id, user_id),
            )?;
            Ok(changed)
        })
    }

    /// Hard-delete every message of a room. Returns the attachment keys the
    /// deleted messages referenced so the caller can drop the blobs.
    pub fn delete_room_messages(&self, room_id: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let keys = delete_room_messages_tx(&tx, room_id)?;
            tx.commit()?;
            Ok(keys)
        })
    }

    pub fn count_unread(&self, sender_id: &str, recipient_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 WHERE m.sender_id = ?1 AND m.recipient_id = ?2 AND m.status = ?3
                   AND NOT EXISTS (
                       SELECT 1 FROM message_deletions d
                       WHERE d.message_id = m.id AND d.user_id = ?2
                   )",
                (sender_id, recipient_id, MessageStatus::Received.as_str()),
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Unread counts addressed to `recipient_id`, grouped by sender.
    pub fn unread_counts(&self, recipient_id: &str) -> Result<HashMap<String, u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.sender_id, COUNT(*) FROM messages m
                 WHERE m.recipient_id = ?1 AND m.status = ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM message_deletions d
                       WHERE d.message_id = m.id AND d.user_id = ?1
                   )
                 GROUP BY m.sender_id",
            )?;
            let rows = stmt
                .query_map((recipient_id, MessageStatus::Received.as_str()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<std::result::Result<HashMap<_, _>, _>>()?;
            Ok(rows)
        })
    }

    /// Distinct 1:1 counterparts of `user_id` across messages not deleted for them.
    pub fn contact_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END
                 FROM messages m
                 WHERE m.group_id IS NULL
                   AND (m.sender_id = ?1 OR m.recipient_id = ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM message_deletions d
                       WHERE d.message_id = m.id AND d.user_id = ?1
                   )",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, Option<String>>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids
                .into_iter()
                .flatten()
                .filter(|id| id != user_id)
                .collect())
        })
    }

    /// Add `user_id` to the read set of every message in the room authored by
    /// someone else. Returns how many messages gained the reader.
    pub fn mark_room_read_by(&self, room_id: &str, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id)
                 SELECT m.id, ?2 FROM messages m
                 WHERE m.room_id = ?1 AND m.sender_id != ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM message_reads r
                       WHERE r.message_id = m.id AND r.user_id = ?2
                   )",
                (room_id, user_id),
            )?;
            Ok(changed)
        })
    }

    // -- Groups --

    pub fn insert_group(&self, group: &Group) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO groups (id, name, creator_id, avatar_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (
                    group.id.to_string(),
                    &group.name,
                    group.creator_id.to_string(),
                    &group.avatar_key,
                    format_timestamp(&group.created_at),
                ),
            )?;
            for member in &group.member_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                    (group.id.to_string(), member.to_string()),
                )?;
            }
            for muted in &group.muted_by {
                tx.execute(
                    "INSERT OR IGNORE INTO group_mutes (group_id, user_id) VALUES (?1, ?2)",
                    (group.id.to_string(), muted.to_string()),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_group(&self, id: &str) -> Result<Option<Group>> {
        self.with_conn(|conn| {
            query_group(conn, id)?.map(Group::try_from).transpose()
        })
    }

    pub fn groups_for_member(&self, user_id: &str) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY group_id",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut groups = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(row) = query_group(conn, &id)? {
                    groups.push(Group::try_from(row)?);
                }
            }
            Ok(groups)
        })
    }

    pub fn rename_group(&self, id: &str, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE groups SET name = ?2 WHERE id = ?1", (id, name))?;
            Ok(())
        })
    }

    /// Returns the ids that were not members before.
    pub fn add_group_members(&self, id: &str, user_ids: &[String]) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut added = Vec::new();
            for user_id in user_ids {
                let changed = tx.execute(
                    "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                    (id, user_id),
                )?;
                if changed > 0 {
                    added.push(user_id.clone());
                }
            }
            tx.commit()?;
            Ok(added)
        })
    }

    /// Drops the membership and any mute preference. Returns false if the
    /// user was not a member.
    pub fn remove_group_member(&self, id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                (id, user_id),
            )?;
            tx.execute(
                "DELETE FROM group_mutes WHERE group_id = ?1 AND user_id = ?2",
                (id, user_id),
            )?;
            tx.commit()?;
            Ok(changed > 0)
        })
    }

    /// Toggle a mute: removes if present, inserts if not.
    /// Returns true when the user is muted afterwards.
    pub fn toggle_group_mute(&self, id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM group_mutes WHERE group_id = ?1 AND user_id = ?2",
                (id, user_id),
            )?;
            let muted = if removed > 0 {
                false
            } else {
                tx.execute(
                    "INSERT INTO group_mutes (group_id, user_id) VALUES (?1, ?2)",
                    (id, user_id),
                )?;
                true
            };
            tx.commit()?;
            Ok(muted)
        })
    }

    pub fn set_group_avatar(&self, id: &str, avatar_key: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE groups SET avatar_key = ?2 WHERE id = ?1", (id, avatar_key))?;
            Ok(())
        })
    }

    /// Delete a group with its memberships and messages. Returns attachment
    /// keys of the deleted messages.
    pub fn delete_group(&self, id: &str, room_id: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let keys = delete_room_messages_tx(&tx, room_id)?;
            tx.execute("DELETE FROM groups WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(keys)
        })
    }

    // -- Push subscriptions --

    /// Replace the subscription for `(user_id, endpoint)`; last write wins.
    pub fn upsert_push_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
                (user_id, endpoint),
            )?;
            tx.execute(
                "INSERT INTO push_subscriptions (user_id, endpoint, p256dh, auth)
                 VALUES (?1, ?2, ?3, ?4)",
                (user_id, endpoint, p256dh, auth),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn push_subscriptions_for(&self, user_id: &str) -> Result<Vec<PushSubscription>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, endpoint, p256dh, auth FROM push_subscriptions
                 WHERE user_id = ?1 ORDER BY created_at, endpoint",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(PushSubscriptionRow {
                        user_id: row.get(0)?,
                        endpoint: row.get(1)?,
                        p256dh: row.get(2)?,
                        auth: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(PushSubscription::try_from).collect()
        })
    }

    pub fn delete_push_subscription(&self, user_id: &str, endpoint: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
                (user_id, endpoint),
            )?;
            Ok(changed)
        })
    }

    pub fn delete_push_subscriptions_for(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed =
                conn.execute("DELETE FROM push_subscriptions WHERE user_id = ?1", [user_id])?;
            Ok(changed)
        })
    }
}

fn map_room_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        room_id: row.get(0)?,
        user_a: row.get(1)?,
        user_b: row.get(2)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        recipient_id: row.get(4)?,
        group_id: row.get(5)?,
        content: row.get(6)?,
        kind: row.get(7)?,
        attachment_key: row.get(8)?,
        status: row.get(9)?,
        sent_at: row.get(10)?,
        deleted_for: Vec::new(),
        read_by: Vec::new(),
    })
}

fn insert_message_tx(tx: &Transaction<'_>, message: &Message) -> Result<()> {
    let id = message.id.to_string();
    tx.execute(
        "INSERT INTO messages (id, room_id, sender_id, sender_name, recipient_id, group_id,
                               content, kind, attachment_key, status, sent_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            id,
            message.room_id,
            message.sender_id.to_string(),
            message.sender_name,
            message.recipient_id.map(|u| u.to_string()),
            message.group_id.map(|u| u.to_string()),
            message.content,
            message.kind.as_str(),
            message.attachment_key,
            message.status.as_str(),
            format_timestamp(&message.sent_at),
        ],
    )?;
    for user in &message.read_by {
        tx.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?1, ?2)",
            (&id, user.to_string()),
        )?;
    }
    for user in &message.deleted_for {
        tx.execute(
            "INSERT OR IGNORE INTO message_deletions (message_id, user_id) VALUES (?1, ?2)",
            (&id, user.to_string()),
        )?;
    }
    Ok(())
}

fn delete_room_messages_tx(tx: &Transaction<'_>, room_id: &str) -> Result<Vec<String>> {
    let keys = {
        let mut stmt = tx.prepare(
            "SELECT attachment_key FROM messages WHERE room_id = ?1 AND attachment_key IS NOT NULL",
        )?;
        stmt.query_map([room_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    tx.execute("DELETE FROM messages WHERE room_id = ?1", [room_id])?;
    Ok(keys)
}

fn query_room_messages(conn: &Connection, query: &RoomQuery<'_>) -> Result<Vec<MessageRow>> {
    let kind = query.kind.map(|k| k.as_str());
    let mut params: Vec<&dyn ToSql> = vec![&query.room_id];
    let mut sql = format!("SELECT {} FROM messages m WHERE m.room_id = ?1", MESSAGE_COLUMNS);

    if let Some(viewer) = &query.hidden_for {
        params.push(viewer);
        sql.push_str(&format!(
            " AND NOT EXISTS (SELECT 1 FROM message_deletions d
                              WHERE d.message_id = m.id AND d.user_id = ?{})",
            params.len()
        ));
    }
    if let Some(kind) = &kind {
        params.push(kind);
        sql.push_str(&format!(" AND m.kind = ?{}", params.len()));
    }

    let order = if query.newest_first { "DESC" } else { "ASC" };
    sql.push_str(&format!(" ORDER BY m.sent_at {order}, m.rowid {order}"));

    let limit = query.limit.map(i64::from).unwrap_or(-1);
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, query.offset));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params.as_slice(), map_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Batch-fill `deleted_for` and `read_by` for a set of message rows.
fn load_message_sets(conn: &Connection, rows: &mut [MessageRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
    let params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();

    let mut deletions: HashMap<String, Vec<String>> = HashMap::new();
    let mut reads: HashMap<String, Vec<String>> = HashMap::new();

    for (table, target) in [("message_deletions", &mut deletions), ("message_reads", &mut reads)] {
        let sql = format!(
            "SELECT message_id, user_id FROM {} WHERE message_id IN ({})",
            table,
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let pairs = stmt
            .query_map(params.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (message_id, user_id) in pairs {
            target.entry(message_id).or_default().push(user_id);
        }
    }

    for row in rows.iter_mut() {
        row.deleted_for = deletions.remove(&row.id).unwrap_or_default();
        row.read_by = reads.remove(&row.id).unwrap_or_default();
    }
    Ok(())
}

fn query_group(conn: &Connection, id: &str) -> Result<Option<GroupRow>> {
    let row = conn
        .query_row(
            "SELECT id, name, creator_id, avatar_key, created_at FROM groups WHERE id = ?1",
            [id],
            |row| {
                Ok(GroupRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    creator_id: row.get(2)?,
                    avatar_key: row.get(3)?,
                    created_at: row.get(4)?,
                    member_ids: Vec::new(),
                    muted_by: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut row) = row else {
        return Ok(None);
    };

    row.member_ids = query_user_column(conn, "group_members", id)?;
    row.muted_by = query_user_column(conn, "group_mutes", id)?;
    Ok(Some(row))
}

fn query_user_column(conn: &Connection, table: &str, group_id: &str) -> Result<Vec<String>> {
    let sql = format!("SELECT user_id FROM {} WHERE group_id = ?1", table);
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([group_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn text_message(room_id: &str, sender: Uuid, recipient: Uuid, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            sender_id: sender,
            sender_name: "sender".into(),
            recipient_id: Some(recipient),
            group_id: None,
            content: content.into(),
            sent_at: Utc::now(),
            status: MessageStatus::Received,
            kind: MessageKind::Text,
            attachment_key: None,
            deleted_for: BTreeSet::new(),
            read_by: BTreeSet::new(),
        }
    }

    #[test]
    fn room_pair_is_written_once_per_direction() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());

        db.insert_room_pair("first", &a, &b).unwrap();
        db.insert_room_pair("second", &a, &b).unwrap();

        assert_eq!(db.find_room(&a, &b).unwrap().unwrap().room_id, "first");
        assert_eq!(db.find_room(&b, &a).unwrap().unwrap().room_id, "first");
        assert_eq!(db.count_room_rows("first").unwrap(), 2);
        assert_eq!(db.count_room_rows("second").unwrap(), 0);
    }

    #[test]
    fn self_room_has_single_row() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4().to_string();
        db.insert_room_pair("self", &a, &a).unwrap();
        assert_eq!(db.count_room_rows("self").unwrap(), 1);
    }

    #[test]
    fn delivered_messages_are_not_touched_again() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let msg = text_message("r", a, b, "hi");
        db.insert_message(&msg).unwrap();

        let first = db.mark_room_delivered("r", &a.to_string(), &b.to_string()).unwrap();
        let second = db.mark_room_delivered("r", &a.to_string(), &b.to_string()).unwrap();
        assert_eq!((first, second), (1, 0));
        assert!(!db.mark_message_delivered(&msg.id.to_string()).unwrap());

        let stored = db.get_message(&msg.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);
    }

    #[test]
    fn hidden_messages_are_filtered_per_viewer() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        db.insert_message(&text_message("r", a, b, "one")).unwrap();
        db.insert_message(&text_message("r", b, a, "two")).unwrap();
        db.hide_room_for_user("r", &a.to_string()).unwrap();

        let a_id = a.to_string();
        let for_a = db
            .room_messages(&RoomQuery { room_id: "r", hidden_for: Some(&a_id), ..Default::default() })
            .unwrap();
        let b_id = b.to_string();
        let for_b = db
            .room_messages(&RoomQuery { room_id: "r", hidden_for: Some(&b_id), ..Default::default() })
            .unwrap();

        assert!(for_a.is_empty());
        assert_eq!(for_b.len(), 2);
        assert!(for_b.iter().all(|m| m.deleted_for.contains(&a)));
    }

    #[test]
    fn toggling_mute_flips_state() {
        let db = Database::open_in_memory().unwrap();
        let creator = Uuid::new_v4();
        let group = Group {
            id: Uuid::new_v4(),
            name: "g".into(),
            creator_id: creator,
            member_ids: BTreeSet::from([creator]),
            muted_by: BTreeSet::new(),
            avatar_key: None,
            created_at: Utc::now(),
        };
        db.insert_group(&group).unwrap();

        let gid = group.id.to_string();
        let uid = creator.to_string();
        assert!(db.toggle_group_mute(&gid, &uid).unwrap());
        assert!(db.get_group(&gid).unwrap().unwrap().is_muted_by(creator));
        assert!(!db.toggle_group_mute(&gid, &uid).unwrap());
        assert!(!db.get_group(&gid).unwrap().unwrap().is_muted_by(creator));
    }

    #[test]
    fn upsert_replaces_keys_for_same_endpoint() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4().to_string();
        db.upsert_push_subscription(&user, "https://push/1", "old", "old").unwrap();
        db.upsert_push_subscription(&user, "https://push/1", "new", "new").unwrap();
        db.upsert_push_subscription(&user, "https://push/2", "k", "a").unwrap();

        let subs = db.push_subscriptions_for(&user).unwrap();
        assert_eq!(subs.len(), 2);
        let first = subs.iter().find(|s| s.endpoint == "https://push/1").unwrap();
        assert_eq!(first.keys.p256dh, "new");
    }
}
