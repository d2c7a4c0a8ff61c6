use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use threadly_types::events::LiveEvent;
use threadly_types::models::{PresenceEntry, PresenceStatus};

use crate::LiveChannel;

/// Without a heartbeat for this long, a user is considered gone.
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(90);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(45);

/// Process-local online/offline state per user.
///
/// Each user's entry is updated under its own shard lock, so heartbeats from
/// different users never contend. A heartbeat racing a sweep for the same
/// user is serialized on that entry: whichever commits last wins.
pub struct PresenceTracker {
    entries: DashMap<Uuid, PresenceEntry>,
    live: Arc<dyn LiveChannel>,
    ttl: TimeDelta,
}

impl PresenceTracker {
    pub fn new(live: Arc<dyn LiveChannel>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            live,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Explicit connect or disconnect. Always broadcasts.
    pub fn set_status(&self, user_id: Uuid, status: PresenceStatus) {
        self.set_status_at(user_id, status, Utc::now());
    }

    pub fn set_status_at(&self, user_id: Uuid, status: PresenceStatus, now: DateTime<Utc>) {
        self.entries.insert(
            user_id,
            PresenceEntry {
                user_id,
                status,
                last_heartbeat_at: status.is_online().then_some(now),
            },
        );
        debug!("{} is now {}", user_id, status);
        self.broadcast(user_id, status);
    }

    /// Refresh the TTL. Broadcasts only when the user was not already online.
    pub fn heartbeat(&self, user_id: Uuid) {
        self.heartbeat_at(user_id, Utc::now());
    }

    pub fn heartbeat_at(&self, user_id: Uuid, now: DateTime<Utc>) {
        let previous = {
            let mut entry = self.entries.entry(user_id).or_insert(PresenceEntry {
                user_id,
                status: PresenceStatus::Offline,
                last_heartbeat_at: None,
            });
            let previous = entry.status;
            entry.status = PresenceStatus::Online;
            entry.last_heartbeat_at = Some(now);
            previous
        };

        if !previous.is_online() {
            debug!("{} back online via heartbeat", user_id);
            self.broadcast(user_id, PresenceStatus::Online);
        }
    }

    /// Flip every online user whose last heartbeat is older than the TTL to
    /// offline. Returns how many users were expired.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| self.is_stale(entry.value(), now))
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for user_id in candidates {
            // Re-check under the entry lock: a heartbeat may have landed since
            let flipped = match self.entries.get_mut(&user_id) {
                Some(mut entry) if self.is_stale(&entry, now) => {
                    entry.status = PresenceStatus::Offline;
                    entry.last_heartbeat_at = None;
                    true
                }
                _ => false,
            };

            if flipped {
                debug!("Marking {} offline (no heartbeat for {}s)", user_id, self.ttl.num_seconds());
                self.broadcast(user_id, PresenceStatus::Offline);
                expired += 1;
            }
        }
        expired
    }

    /// Unknown users are offline.
    pub fn get_status(&self, user_id: Uuid) -> PresenceStatus {
        self.entries
            .get(&user_id)
            .map(|entry| entry.status)
            .unwrap_or_default()
    }

    pub fn last_seen(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.entries
            .get(&user_id)
            .and_then(|entry| entry.last_heartbeat_at)
    }

    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries.iter().map(|entry| *entry.value()).collect()
    }

    /// Spawn the periodic sweep. The task runs until the handle is stopped.
    pub fn start_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let tracker = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = tracker.sweep();
                        if expired > 0 {
                            info!("Presence sweep expired {} user(s)", expired);
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            info!("Presence sweeper stopped");
        });

        info!("Presence sweeper started (every {}s)", period.as_secs());
        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    fn is_stale(&self, entry: &PresenceEntry, now: DateTime<Utc>) -> bool {
        entry.status.is_online()
            && entry
                .last_heartbeat_at
                .is_some_and(|seen| now.signed_duration_since(seen) > self.ttl)
    }

    fn broadcast(&self, user_id: Uuid, status: PresenceStatus) {
        self.live
            .broadcast(LiveEvent::PresenceUpdate { user_id, status });
    }
}

/// Owns the background sweep task.
pub struct SweeperHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}
