use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rooms (
            user_a      TEXT NOT NULL,
            user_b      TEXT NOT NULL,
            room_id     TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_a, user_b)
        );

        CREATE INDEX IF NOT EXISTS idx_rooms_room_id
            ON rooms(room_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            room_id         TEXT NOT NULL,
            sender_id       TEXT NOT NULL,
            sender_name     TEXT NOT NULL DEFAULT '',
            recipient_id    TEXT,
            group_id        TEXT,
            content         TEXT NOT NULL DEFAULT '',
            kind            TEXT NOT NULL DEFAULT 'TEXT',
            attachment_key  TEXT,
            status          TEXT NOT NULL DEFAULT 'RECEIVED',
            sent_at         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, sent_at);

        CREATE INDEX IF NOT EXISTS idx_messages_recipient_status
            ON messages(recipient_id, status);

        CREATE TABLE IF NOT EXISTS message_deletions (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_message_deletions_user
            ON message_deletions(user_id);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS groups (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            creator_id  TEXT NOT NULL,
            avatar_key  TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_user
            ON group_members(user_id);

        CREATE TABLE IF NOT EXISTS group_mutes (
            group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS push_subscriptions (
            user_id     TEXT NOT NULL,
            endpoint    TEXT NOT NULL,
            p256dh      TEXT NOT NULL,
            auth        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_id, endpoint)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
