//! Recording doubles for the coordinator seams.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use uuid::Uuid;

use threadly_db::Database;
use threadly_gateway::{LiveChannel, PresenceTracker};
use threadly_types::api::PushPayload;
use threadly_types::events::LiveEvent;
use threadly_types::models::{PushSubscription, SubscriptionKeys};

use crate::blob::{BlobObject, BlobStore, content_type_for};
use crate::push::{PushNotifier, PushOutcome, PushProvider};

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(Uuid, LiveEvent)>>,
    broadcasts: Mutex<Vec<LiveEvent>>,
}

impl LiveChannel for RecordingChannel {
    fn send_to_user(&self, user_id: Uuid, event: LiveEvent) {
        self.sent.lock().unwrap().push((user_id, event));
    }

    fn broadcast(&self, event: LiveEvent) {
        self.broadcasts.lock().unwrap().push(event);
    }
}

impl RecordingChannel {
    /// Events sent to `user_id` on the named channel.
    pub fn sent_to(&self, user_id: Uuid, channel: &str) -> Vec<LiveEvent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(uid, event)| *uid == user_id && event.channel() == channel)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Broadcast events on the named channel.
    pub fn broadcasts(&self, channel: &str) -> Vec<LiveEvent> {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.channel() == channel)
            .cloned()
            .collect()
    }

    pub fn recipients(&self, channel: &str) -> Vec<Uuid> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event)| event.channel() == channel)
            .map(|(uid, _)| *uid)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
        self.broadcasts.lock().unwrap().clear();
    }
}

#[derive(Default)]
pub struct RecordingPush {
    dispatched: Mutex<Vec<(Uuid, PushPayload)>>,
}

impl PushNotifier for RecordingPush {
    fn dispatch(&self, user_id: Uuid, payload: PushPayload) {
        self.dispatched.lock().unwrap().push((user_id, payload));
    }
}

impl RecordingPush {
    pub fn dispatched(&self) -> Vec<(Uuid, PushPayload)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn count_for(&self, user_id: Uuid) -> usize {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .count()
    }
}

/// Provider returning a scripted outcome per endpoint (default: delivered).
#[derive(Default)]
pub struct ScriptedProvider {
    outcomes: Mutex<HashMap<String, PushOutcome>>,
    hanging: Mutex<HashSet<String>>,
    attempted: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn script(&self, endpoint: &str, outcome: PushOutcome) {
        self.outcomes.lock().unwrap().insert(endpoint.to_string(), outcome);
    }

    /// Calls to `endpoint` never complete.
    pub fn hang(&self, endpoint: &str) {
        self.hanging.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn attempted(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushProvider for ScriptedProvider {
    async fn send(&self, subscription: &PushSubscription, _payload: &PushPayload) -> PushOutcome {
        self.attempted.lock().unwrap().push(subscription.endpoint.clone());
        let hangs = self.hanging.lock().unwrap().contains(&subscription.endpoint);
        if hangs {
            std::future::pending::<()>().await;
        }
        self.outcomes
            .lock()
            .unwrap()
            .get(&subscription.endpoint)
            .cloned()
            .unwrap_or(PushOutcome::Delivered)
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: Bytes, _content_type: &str, key: &str) -> Result<String> {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(key.to_string())
    }

    async fn open(&self, key: &str) -> Result<Option<BlobObject>> {
        let Some(bytes) = self.objects.lock().unwrap().get(key).cloned() else {
            return Ok(None);
        };
        let size = bytes.len() as u64;
        Ok(Some(BlobObject {
            stream: futures_util::stream::once(async move { Ok(bytes) }).boxed(),
            content_type: content_type_for(key).to_string(),
            size: Some(size),
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Shared wiring for coordinator tests.
pub struct Harness {
    pub db: Arc<Database>,
    pub live: Arc<RecordingChannel>,
    pub push: Arc<RecordingPush>,
    pub presence: Arc<PresenceTracker>,
    pub blobs: Arc<MemoryBlobStore>,
}

impl Harness {
    pub fn new() -> Self {
        let live = Arc::new(RecordingChannel::default());
        Self {
            db: Arc::new(Database::open_in_memory().unwrap()),
            presence: Arc::new(PresenceTracker::new(live.clone(), Duration::from_secs(90))),
            push: Arc::new(RecordingPush::default()),
            blobs: Arc::new(MemoryBlobStore::default()),
            live,
        }
    }
}

pub fn keys(p256dh: &str) -> SubscriptionKeys {
    SubscriptionKeys {
        p256dh: p256dh.to_string(),
        auth: "auth".to_string(),
    }
}

pub fn payload_for(recipient_id: Uuid) -> PushPayload {
    PushPayload {
        kind: "chat_message".into(),
        title: "New message".into(),
        url: "/chat".into(),
        message_id: Uuid::new_v4(),
        sender_id: Uuid::new_v4(),
        sender_name: "sender".into(),
        recipient_id,
        content: "hi".into(),
        group_id: None,
        group_name: None,
    }
}
