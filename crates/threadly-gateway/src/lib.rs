pub mod connection;
pub mod dispatcher;
pub mod presence;

use threadly_types::events::LiveEvent;
use uuid::Uuid;

pub use dispatcher::Dispatcher;
pub use presence::{PresenceTracker, SweeperHandle};

/// Outbound side of the live channel. Sends never block and never fail:
/// an event for a user with no open connection is dropped.
pub trait LiveChannel: Send + Sync {
    /// Deliver to every open connection of one user.
    fn send_to_user(&self, user_id: Uuid, event: LiveEvent);

    /// Deliver to every open connection.
    fn broadcast(&self, event: LiveEvent);
}
