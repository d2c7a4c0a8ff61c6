use std::sync::Arc;

use threadly_db::Database;
use tracing::info;
use uuid::Uuid;

use crate::{CoreResult, blocking};

/// Maps an unordered user pair to its canonical 1:1 room id.
#[derive(Clone)]
pub struct RoomResolver {
    db: Arc<Database>,
}

impl RoomResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Look up the room for `(user_a, user_b)` in either order. With
    /// `create`, a missing room is minted from the two ids in argument order.
    pub async fn resolve(&self, user_a: Uuid, user_b: Uuid, create: bool) -> CoreResult<Option<String>> {
        blocking(&self.db, move |db| resolve_blocking(db, user_a, user_b, create)).await
    }
}

pub fn room_id_for(user_a: Uuid, user_b: Uuid) -> String {
    format!("{}_{}", user_a, user_b)
}

fn resolve_blocking(db: &Database, user_a: Uuid, user_b: Uuid, create: bool) -> anyhow::Result<Option<String>> {
    let (a, b) = (user_a.to_string(), user_b.to_string());

    if let Some(room) = db.find_room(&a, &b)? {
        return Ok(Some(room.room_id));
    }
    if !create {
        return Ok(None);
    }

    let room_id = room_id_for(user_a, user_b);
    db.insert_room_pair(&room_id, &a, &b)?;

    // Re-read: a concurrent creator may have inserted the pair first
    let room = db.find_room(&a, &b)?.map(|room| room.room_id);
    if room.as_deref() == Some(room_id.as_str()) {
        info!("Created room {}", room_id);
    }
    Ok(room)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> (Arc<Database>, RoomResolver) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (db.clone(), RoomResolver::new(db))
    }

    #[tokio::test]
    async fn either_order_resolves_same_room() {
        let (_, rooms) = resolver();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let created = rooms.resolve(a, b, true).await.unwrap().unwrap();
        assert_eq!(created, format!("{}_{}", a, b));
        assert_eq!(rooms.resolve(b, a, false).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn read_only_lookup_never_creates() {
        let (db, rooms) = resolver();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(rooms.resolve(a, b, false).await.unwrap(), None);
        assert_eq!(db.count_room_rows(&room_id_for(a, b)).unwrap(), 0);
    }

    #[tokio::test]
    async fn creation_is_idempotent() {
        let (db, rooms) = resolver();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = rooms.resolve(a, b, true).await.unwrap();
        let second = rooms.resolve(a, b, true).await.unwrap();
        let reversed = rooms.resolve(b, a, true).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, reversed);
        assert_eq!(db.count_room_rows(&room_id_for(a, b)).unwrap(), 2);
        assert_eq!(db.count_room_rows(&room_id_for(b, a)).unwrap(), 0);
    }

    #[tokio::test]
    async fn self_room_uses_single_entry() {
        let (db, rooms) = resolver();
        let a = Uuid::new_v4();

        let room = rooms.resolve(a, a, true).await.unwrap().unwrap();
        assert_eq!(db.count_room_rows(&room).unwrap(), 1);
    }
}
