use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use threadly_gateway::LiveChannel;
use threadly_types::events::LiveEvent;

use crate::{CoreError, CoreResult, Principal, require};

/// Relays profile changes made by the auth service to every connected client.
#[derive(Clone)]
pub struct ProfileEvents {
    live: Arc<dyn LiveChannel>,
}

impl ProfileEvents {
    pub fn new(live: Arc<dyn LiveChannel>) -> Self {
        Self { live }
    }

    /// Broadcast a new avatar for `user_id`. Callers announce only their own.
    pub fn avatar_updated(&self, principal: Option<&Principal>, user_id: Uuid, avatar_url: &str) -> CoreResult<()> {
        let caller = require(principal)?;
        if caller.user_id != user_id {
            return Err(CoreError::forbidden("cannot announce another user's avatar"));
        }
        let avatar_url = avatar_url.trim();
        if avatar_url.is_empty() {
            return Err(CoreError::bad_request("avatar url is empty"));
        }

        info!("Broadcasting avatar update for {}", user_id);
        self.live.broadcast(LiveEvent::AvatarUpdated {
            user_id,
            avatar_url: avatar_url.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingChannel;

    fn setup() -> (Arc<RecordingChannel>, ProfileEvents) {
        let live = Arc::new(RecordingChannel::default());
        (live.clone(), ProfileEvents::new(live))
    }

    #[test]
    fn avatar_change_is_broadcast_to_everyone() {
        let (live, profiles) = setup();
        let alice = Principal::new(Uuid::new_v4(), "alice");

        profiles
            .avatar_updated(Some(&alice), alice.user_id, " https://cdn/a.png ")
            .unwrap();

        assert_eq!(
            live.broadcasts("avatar-updated"),
            vec![LiveEvent::AvatarUpdated {
                user_id: alice.user_id,
                avatar_url: "https://cdn/a.png".into()
            }]
        );
        assert!(live.recipients("avatar-updated").is_empty());
    }

    #[test]
    fn only_own_avatar_with_url_is_announced() {
        let (live, profiles) = setup();
        let alice = Principal::new(Uuid::new_v4(), "alice");

        let spoofed = profiles.avatar_updated(Some(&alice), Uuid::new_v4(), "https://cdn/b.png");
        let blank = profiles.avatar_updated(Some(&alice), alice.user_id, "  ");
        let anonymous = profiles.avatar_updated(None, alice.user_id, "https://cdn/c.png");

        assert!(matches!(spoofed, Err(CoreError::Forbidden(_))));
        assert!(matches!(blank, Err(CoreError::BadRequest(_))));
        assert!(matches!(anonymous, Err(CoreError::Forbidden(_))));
        assert!(live.broadcasts("avatar-updated").is_empty());
    }
}
