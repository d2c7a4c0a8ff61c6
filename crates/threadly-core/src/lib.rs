//! Threadly chat core
//!
//! Coordinates 1:1 and group delivery on top of the persistence, live
//! channel and push seams. Every public coordinator method takes the caller
//! as `Option<&Principal>` and rejects `None` before touching state.
pub mod blob;
pub mod delivery;
pub mod error;
pub mod groups;
pub mod profiles;
pub mod push;
pub mod rooms;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use threadly_db::Database;
use uuid::Uuid;

pub use blob::{BlobObject, BlobStore, FsBlobStore};
pub use delivery::MessageDeliveryCoordinator;
pub use error::{CoreError, CoreResult};
pub use groups::GroupCoordinator;
pub use profiles::ProfileEvents;
pub use push::{PushDispatcher, PushNotifier, PushOutcome, PushProvider, WebPushProvider};
pub use rooms::RoomResolver;

/// An already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub username: String,
}

impl Principal {
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

pub const MAX_PAGE_SIZE: u32 = 200;
pub const DEFAULT_PAGE_SIZE: u32 = 50;

pub(crate) fn require(principal: Option<&Principal>) -> CoreResult<&Principal> {
    principal.ok_or_else(|| CoreError::forbidden("no authenticated principal"))
}

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`; zero means default.
pub(crate) fn page_size(size: u32) -> u32 {
    match size {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    }
}

/// Run database work on the blocking pool.
pub(crate) async fn blocking<F, T>(db: &Arc<Database>, f: F) -> CoreResult<T>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    let result = tokio::task::spawn_blocking(move || f(&db)).await?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(page_size(0), DEFAULT_PAGE_SIZE);
        assert_eq!(page_size(1), 1);
        assert_eq!(page_size(10_000), MAX_PAGE_SIZE);
    }

    #[test]
    fn missing_principal_is_forbidden() {
        assert!(matches!(require(None), Err(CoreError::Forbidden(_))));
        let p = Principal::new(Uuid::nil(), "a");
        assert_eq!(require(Some(&p)).unwrap().username, "a");
    }
}
