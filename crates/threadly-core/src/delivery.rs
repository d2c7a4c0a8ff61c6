use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use threadly_db::{Database, RoomQuery};
use threadly_gateway::{LiveChannel, PresenceTracker};
use threadly_types::api::PushPayload;
use threadly_types::events::LiveEvent;
use threadly_types::models::{Message, MessageKind, MessagePage, MessageStatus, PresenceStatus};

use crate::blob::{BlobObject, BlobStore, extension_for};
use crate::push::{PushNotifier, preview};
use crate::rooms::RoomResolver;
use crate::{CoreError, CoreResult, Principal, blocking, page_size, require};

/// Orchestrates 1:1 persistence, status transitions, live notification and
/// push fallback.
#[derive(Clone)]
pub struct MessageDeliveryCoordinator {
    db: Arc<Database>,
    rooms: RoomResolver,
    presence: Arc<PresenceTracker>,
    push: Arc<dyn PushNotifier>,
    live: Arc<dyn LiveChannel>,
    blobs: Arc<dyn BlobStore>,
    max_upload_bytes: usize,
}

impl MessageDeliveryCoordinator {
    pub fn new(
        db: Arc<Database>,
        presence: Arc<PresenceTracker>,
        push: Arc<dyn PushNotifier>,
        live: Arc<dyn LiveChannel>,
        blobs: Arc<dyn BlobStore>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            rooms: RoomResolver::new(db.clone()),
            db,
            presence,
            push,
            live,
            blobs,
            max_upload_bytes,
        }
    }

    // -- Sending --

    /// Send a text message. Media goes through `send_attachment`; SYSTEM
    /// messages are only ever generated by the server.
    pub async fn send(
        &self,
        principal: Option<&Principal>,
        recipient_id: Uuid,
        content: String,
        kind: MessageKind,
    ) -> CoreResult<Message> {
        let sender = require(principal)?;
        if kind == MessageKind::System {
            return Err(CoreError::bad_request("system messages cannot be sent by users"));
        }
        if kind.is_media() {
            return Err(CoreError::bad_request(format!(
                "{} messages need an attachment",
                kind.as_str()
            )));
        }
        if content.trim().is_empty() {
            return Err(CoreError::bad_request("message content is empty"));
        }

        let room_id = self.resolve_room(sender.user_id, recipient_id).await?;
        self.deliver(sender, recipient_id, room_id, content, kind, None)
            .await
    }

    /// Upload an IMAGE, VOICE or VIDEO attachment and send it as a message.
    pub async fn send_attachment(
        &self,
        principal: Option<&Principal>,
        recipient_id: Uuid,
        kind: MessageKind,
        bytes: Bytes,
        content_type: &str,
        caption: Option<String>,
    ) -> CoreResult<Message> {
        let sender = require(principal)?;
        if !kind.is_media() {
            return Err(CoreError::bad_request(format!(
                "{} is not an attachment kind",
                kind.as_str()
            )));
        }
        let family = match kind {
            MessageKind::Image => "image/",
            MessageKind::Voice => "audio/",
            _ => "video/",
        };
        if bytes.is_empty() {
            return Err(CoreError::bad_request("attachment is empty"));
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(CoreError::bad_request(format!(
                "attachment exceeds {} bytes",
                self.max_upload_bytes
            )));
        }
        let ext = extension_for(content_type)
            .filter(|_| content_type.to_ascii_lowercase().starts_with(family))
            .ok_or_else(|| {
                CoreError::bad_request(format!("unsupported content type '{}'", content_type))
            })?;

        let room_id = self.resolve_room(sender.user_id, recipient_id).await?;
        let key = format!("chats/{}/{}.{}", room_id, Uuid::new_v4(), ext);
        self.blobs.upload(bytes, content_type, &key).await?;

        let content = caption.unwrap_or_default();
        match self
            .deliver(sender, recipient_id, room_id, content, kind, Some(key.clone()))
            .await
        {
            Ok(message) => Ok(message),
            Err(e) => {
                if let Err(cleanup) = self.blobs.delete(&key).await {
                    warn!("Failed to remove orphaned blob {}: {}", key, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Persist, notify the recipient, push if they are not online, then ack
    /// the sender. Persistence happens before any notification.
    async fn deliver(
        &self,
        sender: &Principal,
        recipient_id: Uuid,
        room_id: String,
        content: String,
        kind: MessageKind,
        attachment_key: Option<String>,
    ) -> CoreResult<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            room_id,
            sender_id: sender.user_id,
            sender_name: sender.username.clone(),
            recipient_id: Some(recipient_id),
            group_id: None,
            content,
            sent_at: Utc::now(),
            status: MessageStatus::Received,
            kind,
            attachment_key,
            deleted_for: BTreeSet::new(),
            read_by: BTreeSet::new(),
        };

        let stored = message.clone();
        blocking(&self.db, move |db| db.insert_message(&stored)).await?;

        self.live.send_to_user(
            recipient_id,
            LiveEvent::MessageNotification {
                id: message.id,
                sender_id: message.sender_id,
                sender_name: message.sender_name.clone(),
            },
        );

        let status = self.presence.get_status(recipient_id);
        if status.is_online() {
            debug!("{} is online, no push for {}", recipient_id, message.id);
        } else {
            self.push.dispatch(recipient_id, push_payload(&message, recipient_id));
        }

        self.live
            .send_to_user(sender.user_id, LiveEvent::SentAck(message.clone()));

        debug!(
            "{} -> {}: stored {} message {}",
            sender.user_id,
            recipient_id,
            message.kind.as_str(),
            message.id
        );
        Ok(message)
    }

    // -- Reading --

    /// Every message of the conversation visible to the caller, oldest first.
    /// Messages from the contact move to DELIVERED and the contact gets a
    /// read receipt when anything changed.
    pub async fn fetch_conversation(&self, principal: Option<&Principal>, contact_id: Uuid) -> CoreResult<Vec<Message>> {
        let me = require(principal)?.user_id;
        let Some(room_id) = self.rooms.resolve(me, contact_id, false).await? else {
            return Ok(Vec::new());
        };

        self.acknowledge(&room_id, me, contact_id).await?;

        blocking(&self.db, move |db| {
            let viewer = me.to_string();
            db.room_messages(&RoomQuery {
                room_id: &room_id,
                hidden_for: Some(&viewer),
                ..Default::default()
            })
        })
        .await
    }

    /// Newest-first page of the conversation, with the same delivery side
    /// effect as `fetch_conversation`.
    pub async fn conversation_page(
        &self,
        principal: Option<&Principal>,
        contact_id: Uuid,
        page: u32,
        size: u32,
    ) -> CoreResult<MessagePage> {
        let me = require(principal)?.user_id;
        let Some(room_id) = self.rooms.resolve(me, contact_id, false).await? else {
            return Ok(empty_page());
        };

        self.acknowledge(&room_id, me, contact_id).await?;
        self.page(room_id, me, None, page, size).await
    }

    /// Newest-first page of the IMAGE messages in a conversation.
    pub async fn media_page(
        &self,
        principal: Option<&Principal>,
        contact_id: Uuid,
        page: u32,
        size: u32,
    ) -> CoreResult<MessagePage> {
        let me = require(principal)?.user_id;
        let Some(room_id) = self.rooms.resolve(me, contact_id, false).await? else {
            return Ok(empty_page());
        };
        self.page(room_id, me, Some(MessageKind::Image), page, size).await
    }

    /// Load one message the caller may see. Opening a 1:1 message as its
    /// recipient marks it DELIVERED.
    pub async fn find_message(&self, principal: Option<&Principal>, id: Uuid) -> CoreResult<Message> {
        let me = require(principal)?.user_id;
        let mut message = self.visible_message(me, id).await?;

        if message.recipient_id == Some(me) && message.status.can_advance_to(MessageStatus::Delivered) {
            let advanced = blocking(&self.db, move |db| db.mark_message_delivered(&id.to_string())).await?;
            if advanced {
                message.status = MessageStatus::Delivered;
            }
        }
        Ok(message)
    }

    /// Open the attachment of a message the caller may see.
    pub async fn attachment(&self, principal: Option<&Principal>, message_id: Uuid) -> CoreResult<BlobObject> {
        let me = require(principal)?.user_id;
        let message = self.visible_message(me, message_id).await?;
        let key = message
            .attachment_key
            .ok_or_else(|| CoreError::not_found("attachment"))?;

        self.blobs
            .open(&key)
            .await?
            .ok_or_else(|| CoreError::not_found("attachment"))
    }

    pub async fn count_unread(&self, principal: Option<&Principal>, contact_id: Uuid) -> CoreResult<u64> {
        let me = require(principal)?.user_id;
        blocking(&self.db, move |db| {
            db.count_unread(&contact_id.to_string(), &me.to_string())
        })
        .await
    }

    /// Unread counts addressed to the caller, keyed by contact.
    pub async fn unread_counts(&self, principal: Option<&Principal>) -> CoreResult<HashMap<Uuid, u64>> {
        let me = require(principal)?.user_id;
        let raw = blocking(&self.db, move |db| db.unread_counts(&me.to_string())).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(sender, count)| sender.parse().ok().map(|id| (id, count)))
            .collect())
    }

    /// Everyone the caller has a visible 1:1 history with.
    pub async fn contacts(&self, principal: Option<&Principal>) -> CoreResult<Vec<Uuid>> {
        let me = require(principal)?.user_id;
        let raw = blocking(&self.db, move |db| db.contact_ids(&me.to_string())).await?;
        let mut ids: Vec<Uuid> = raw.iter().filter_map(|id| id.parse().ok()).collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn contact_statuses(&self, principal: Option<&Principal>) -> CoreResult<HashMap<Uuid, PresenceStatus>> {
        let contacts = self.contacts(principal).await?;
        Ok(contacts
            .into_iter()
            .map(|id| (id, self.presence.get_status(id)))
            .collect())
    }

    // -- Deleting --

    /// Hide the whole conversation from the caller only.
    pub async fn delete_for_user(&self, principal: Option<&Principal>, contact_id: Uuid) -> CoreResult<()> {
        let me = require(principal)?.user_id;
        let Some(room_id) = self.rooms.resolve(me, contact_id, false).await? else {
            return Ok(());
        };

        let hidden = blocking(&self.db, move |db| db.hide_room_for_user(&room_id, &me.to_string())).await?;
        info!("{} hid {} message(s) with {}", me, hidden, contact_id);
        Ok(())
    }

    /// Remove the conversation for both participants, attachments included.
    pub async fn delete_for_both(&self, principal: Option<&Principal>, contact_id: Uuid) -> CoreResult<()> {
        let me = require(principal)?.user_id;
        let Some(room_id) = self.rooms.resolve(me, contact_id, false).await? else {
            return Ok(());
        };

        let keys = blocking(&self.db, move |db| db.delete_room_messages(&room_id)).await?;
        for key in &keys {
            if let Err(e) = self.blobs.delete(key).await {
                warn!("Failed to delete attachment {}: {}", key, e);
            }
        }
        info!(
            "{} deleted conversation with {} ({} attachment(s))",
            me,
            contact_id,
            keys.len()
        );
        Ok(())
    }

    // -- Helpers --

    async fn resolve_room(&self, sender_id: Uuid, recipient_id: Uuid) -> CoreResult<String> {
        self.rooms
            .resolve(sender_id, recipient_id, true)
            .await?
            .ok_or_else(|| CoreError::Infrastructure(anyhow::anyhow!("room was not created")))
    }

    /// Advance the contact's RECEIVED messages and send a receipt if any moved.
    async fn acknowledge(&self, room_id: &str, me: Uuid, contact_id: Uuid) -> CoreResult<usize> {
        let room = room_id.to_string();
        let advanced = blocking(&self.db, move |db| {
            db.mark_room_delivered(&room, &contact_id.to_string(), &me.to_string())
        })
        .await?;

        if advanced > 0 {
            debug!("{} opened {}: {} message(s) delivered", me, room_id, advanced);
            self.live
                .send_to_user(contact_id, LiveEvent::ReadReceipt { reader_id: me });
        }
        Ok(advanced)
    }

    async fn page(
        &self,
        room_id: String,
        viewer: Uuid,
        kind: Option<MessageKind>,
        page: u32,
        size: u32,
    ) -> CoreResult<MessagePage> {
        let size = page_size(size);
        let offset = page.saturating_mul(size);

        let mut items = blocking(&self.db, move |db| {
            let viewer = viewer.to_string();
            db.room_messages(&RoomQuery {
                room_id: &room_id,
                hidden_for: Some(&viewer),
                kind,
                newest_first: true,
                offset,
                limit: Some(size + 1),
            })
        })
        .await?;

        let has_more = items.len() > size as usize;
        items.truncate(size as usize);
        Ok(MessagePage {
            items,
            has_more,
            next_page: has_more.then_some(page.saturating_add(1)),
        })
    }

    /// Load a message and check the caller may see it.
    async fn visible_message(&self, me: Uuid, id: Uuid) -> CoreResult<Message> {
        let message = blocking(&self.db, move |db| db.get_message(&id.to_string()))
            .await?
            .filter(|m| m.is_visible_to(me))
            .ok_or_else(|| CoreError::not_found("message"))?;

        let allowed = match message.group_id {
            Some(group_id) => blocking(&self.db, move |db| db.get_group(&group_id.to_string()))
                .await?
                .is_some_and(|group| group.is_member(me)),
            None => message.sender_id == me || message.recipient_id == Some(me),
        };

        if !allowed {
            return Err(CoreError::forbidden("not a participant of this conversation"));
        }
        Ok(message)
    }
}

fn empty_page() -> MessagePage {
    MessagePage {
        items: Vec::new(),
        has_more: false,
        next_page: None,
    }
}

fn push_payload(message: &Message, recipient_id: Uuid) -> PushPayload {
    PushPayload {
        kind: "chat_message".to_string(),
        title: message.sender_name.clone(),
        url: "/chat".to_string(),
        message_id: message.id,
        sender_id: message.sender_id,
        sender_name: message.sender_name.clone(),
        recipient_id,
        content: preview(message.kind, &message.content),
        group_id: None,
        group_name: None,
    }
}
