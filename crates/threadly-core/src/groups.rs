use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use threadly_db::{Database, RoomQuery};
use threadly_gateway::{LiveChannel, PresenceTracker};
use threadly_types::api::PushPayload;
use threadly_types::events::LiveEvent;
use threadly_types::models::{
    Group, GroupOverview, Message, MessageKind, MessagePage, MessageStatus, group_room_id,
};

use crate::blob::{BlobObject, BlobStore, extension_for};
use crate::push::{PushNotifier, preview};
use crate::{CoreError, CoreResult, Principal, blocking, page_size, require};

const AVATAR_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

/// Membership changes, fan-out, mute and read tracking for groups.
#[derive(Clone)]
pub struct GroupCoordinator {
    db: Arc<Database>,
    presence: Arc<PresenceTracker>,
    push: Arc<dyn PushNotifier>,
    live: Arc<dyn LiveChannel>,
    blobs: Arc<dyn BlobStore>,
    max_upload_bytes: usize,
}

impl GroupCoordinator {
    pub fn new(
        db: Arc<Database>,
        presence: Arc<PresenceTracker>,
        push: Arc<dyn PushNotifier>,
        live: Arc<dyn LiveChannel>,
        blobs: Arc<dyn BlobStore>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            db,
            presence,
            push,
            live,
            blobs,
            max_upload_bytes,
        }
    }

    // -- Lifecycle --

    pub async fn create(&self, principal: Option<&Principal>, name: &str, member_ids: Vec<Uuid>) -> CoreResult<Group> {
        let creator = require(principal)?;
        let name = valid_name(name)?;

        let mut members: BTreeSet<Uuid> = member_ids.into_iter().collect();
        members.insert(creator.user_id);

        let group = Group {
            id: Uuid::new_v4(),
            name,
            creator_id: creator.user_id,
            member_ids: members,
            muted_by: BTreeSet::new(),
            avatar_key: None,
            created_at: Utc::now(),
        };
        let stored = group.clone();
        blocking(&self.db, move |db| db.insert_group(&stored)).await?;

        info!(
            "{} created group {} ({} members)",
            creator.user_id,
            group.id,
            group.member_ids.len()
        );
        self.notify_update(&group, None);
        self.system_message(&group, creator.user_id, &creator.username, "created", &group.member_ids)
            .await?;
        Ok(group)
    }

    pub async fn get(&self, principal: Option<&Principal>, group_id: Uuid) -> CoreResult<Group> {
        let me = require(principal)?.user_id;
        self.member_group(group_id, me).await
    }

    /// Groups the caller belongs to, most recently active first.
    pub async fn list_for_user(&self, principal: Option<&Principal>) -> CoreResult<Vec<GroupOverview>> {
        let me = require(principal)?.user_id;
        let mut overviews: Vec<_> = blocking(&self.db, move |db| {
            db.groups_for_member(&me.to_string())?
                .into_iter()
                .map(|group| -> anyhow::Result<GroupOverview> {
                    let last_message = db.latest_room_message(&group_room_id(group.id))?;
                    Ok(GroupOverview {
                        group,
                        last_message,
                    })
                })
                .collect()
        })
        .await?;

        overviews.sort_by_key(|o| {
            std::cmp::Reverse(
                o.last_message
                    .as_ref()
                    .map_or(o.group.created_at, |m| m.sent_at),
            )
        });
        Ok(overviews)
    }

    pub async fn rename(&self, principal: Option<&Principal>, group_id: Uuid, name: &str) -> CoreResult<Group> {
        let me = require(principal)?.user_id;
        let group = self.load(group_id).await?;
        if !group.is_creator(me) {
            return Err(CoreError::forbidden("only the creator can rename the group"));
        }
        let name = valid_name(name)?;

        blocking(&self.db, move |db| db.rename_group(&group_id.to_string(), &name)).await?;
        let group = self.load(group_id).await?;
        self.notify_update(&group, None);
        Ok(group)
    }

    pub async fn add_members(&self, principal: Option<&Principal>, group_id: Uuid, member_ids: Vec<Uuid>) -> CoreResult<Group> {
        let me = require(principal)?.user_id;
        let group = self.load(group_id).await?;
        if !group.is_creator(me) {
            return Err(CoreError::forbidden("only the creator can add members"));
        }

        let requested: Vec<String> = member_ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .iter()
            .map(Uuid::to_string)
            .collect();
        let added = blocking(&self.db, move |db| db.add_group_members(&group_id.to_string(), &requested)).await?;

        let group = self.load(group_id).await?;
        self.notify_update(&group, None);
        for new_member in added.iter().filter_map(|id| id.parse::<Uuid>().ok()) {
            info!("{} added {} to group {}", me, new_member, group_id);
            self.system_message(&group, new_member, "", "joined", &group.member_ids)
                .await?;
        }
        Ok(group)
    }

    /// Remove `target_id`. Only the creator may remove others; anyone but
    /// the creator may leave. The creator never leaves except by deleting.
    pub async fn remove_member(&self, principal: Option<&Principal>, group_id: Uuid, target_id: Uuid) -> CoreResult<Group> {
        let caller = require(principal)?;
        let group = self.load(group_id).await?;

        let self_leave = caller.user_id == target_id;
        if !self_leave && !group.is_creator(caller.user_id) {
            return Err(CoreError::forbidden("only the creator can remove members"));
        }
        if group.is_creator(target_id) {
            return Err(CoreError::bad_request(
                "the creator cannot leave the group, delete it instead",
            ));
        }
        if !group.is_member(target_id) {
            return Err(CoreError::not_found("member"));
        }

        blocking(&self.db, move |db| {
            db.remove_group_member(&group_id.to_string(), &target_id.to_string())
        })
        .await?;
        let group = self.load(group_id).await?;

        let (content, name) = if self_leave {
            ("left", caller.username.as_str())
        } else {
            ("removed", "")
        };
        info!("{} {} group {}", target_id, content, group_id);

        let mut audience = group.member_ids.clone();
        audience.insert(target_id);
        self.system_message(&group, target_id, name, content, &audience)
            .await?;
        self.notify_update(&group, Some(target_id));
        Ok(group)
    }

    /// Creator-only. Drops messages, attachments and the avatar as well.
    pub async fn delete(&self, principal: Option<&Principal>, group_id: Uuid) -> CoreResult<()> {
        let me = require(principal)?.user_id;
        let group = self.load(group_id).await?;
        if !group.is_creator(me) {
            return Err(CoreError::forbidden("only the creator can delete the group"));
        }

        let mut keys = blocking(&self.db, move |db| {
            db.delete_group(&group_id.to_string(), &group_room_id(group_id))
        })
        .await?;
        keys.extend(group.avatar_key.clone());

        for key in &keys {
            if let Err(e) = self.blobs.delete(key).await {
                warn!("Failed to delete blob {} of group {}: {}", key, group_id, e);
            }
        }
        for member in &group.member_ids {
            self.live
                .send_to_user(*member, LiveEvent::GroupDeleted { id: group_id });
        }
        info!("{} deleted group {}", me, group_id);
        Ok(())
    }

    // -- Messages --

    /// Post a message from a member and fan it out.
    pub async fn send_message(
        &self,
        principal: Option<&Principal>,
        group_id: Uuid,
        content: String,
        kind: MessageKind,
    ) -> CoreResult<Message> {
        let sender = require(principal)?;
        if kind != MessageKind::Text {
            return Err(CoreError::bad_request(format!(
                "{} messages cannot be posted directly",
                kind.as_str()
            )));
        }
        if content.trim().is_empty() {
            return Err(CoreError::bad_request("message content is empty"));
        }

        let group = self.member_group(group_id, sender.user_id).await?;
        let message = self
            .post(&group, sender.user_id, &sender.username, content, kind)
            .await?;

        for member in group.member_ids.iter().filter(|id| **id != sender.user_id) {
            self.live
                .send_to_user(*member, LiveEvent::GroupMessage(message.clone()));

            if group.is_muted_by(*member) {
                debug!("{} muted group {}, no push", member, group.id);
            } else if self.presence.get_status(*member).is_online() {
                debug!("{} is online, no push for {}", member, message.id);
            } else {
                self.push
                    .dispatch(*member, push_payload(&group, &message, *member));
            }
        }

        // Own copy goes on the ack channel, never the fan-out channel
        self.live
            .send_to_user(sender.user_id, LiveEvent::SentAck(message.clone()));
        Ok(message)
    }

    pub async fn messages_page(&self, principal: Option<&Principal>, group_id: Uuid, page: u32, size: u32) -> CoreResult<MessagePage> {
        let me = require(principal)?.user_id;
        self.member_group(group_id, me).await?;

        let size = page_size(size);
        let offset = page.saturating_mul(size);
        let mut items = blocking(&self.db, move |db| {
            let room_id = group_room_id(group_id);
            db.room_messages(&RoomQuery {
                room_id: &room_id,
                newest_first: true,
                offset,
                limit: Some(size + 1),
                ..Default::default()
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

    /// Add the caller to `read_by` of every message from someone else.
    /// Returns how many messages changed; zero is a normal outcome.
    pub async fn mark_read(&self, principal: Option<&Principal>, group_id: Uuid) -> CoreResult<usize> {
        let me = require(principal)?.user_id;
        self.member_group(group_id, me).await?;

        let marked = blocking(&self.db, move |db| {
            db.mark_room_read_by(&group_room_id(group_id), &me.to_string())
        })
        .await?;
        debug!("{} read {} message(s) in group {}", me, marked, group_id);
        Ok(marked)
    }

    /// Flip push muting for the caller. Live delivery is unaffected.
    pub async fn toggle_mute(&self, principal: Option<&Principal>, group_id: Uuid) -> CoreResult<Group> {
        let me = require(principal)?.user_id;
        self.member_group(group_id, me).await?;

        let muted = blocking(&self.db, move |db| {
            db.toggle_group_mute(&group_id.to_string(), &me.to_string())
        })
        .await?;
        debug!("{} {} group {}", me, if muted { "muted" } else { "unmuted" }, group_id);
        self.load(group_id).await
    }

    // -- Avatar --

    pub async fn upload_avatar(
        &self,
        principal: Option<&Principal>,
        group_id: Uuid,
        bytes: Bytes,
        content_type: &str,
    ) -> CoreResult<Group> {
        let me = require(principal)?.user_id;
        let group = self.load(group_id).await?;
        if !group.is_creator(me) {
            return Err(CoreError::forbidden("only the creator can change the avatar"));
        }
        if bytes.is_empty() {
            return Err(CoreError::bad_request("avatar file is empty"));
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(CoreError::bad_request(format!(
                "avatar exceeds {} bytes",
                self.max_upload_bytes
            )));
        }
        let ext = AVATAR_TYPES
            .contains(&content_type)
            .then(|| extension_for(content_type))
            .flatten()
            .ok_or_else(|| CoreError::bad_request("avatar must be JPEG, PNG or WebP"))?;

        let key = format!("groups/{}/avatar.{}", group_id, ext);
        if let Some(old) = group.avatar_key.as_deref().filter(|old| *old != key) {
            if let Err(e) = self.blobs.delete(old).await {
                warn!("Failed to delete old avatar {}: {}", old, e);
            }
        }
        self.blobs.upload(bytes, content_type, &key).await?;

        blocking(&self.db, move |db| {
            db.set_group_avatar(&group_id.to_string(), Some(&key))
        })
        .await?;
        let group = self.load(group_id).await?;
        self.notify_update(&group, None);
        Ok(group)
    }

    pub async fn avatar(&self, principal: Option<&Principal>, group_id: Uuid) -> CoreResult<BlobObject> {
        let me = require(principal)?.user_id;
        let group = self.member_group(group_id, me).await?;
        let key = group
            .avatar_key
            .ok_or_else(|| CoreError::not_found("avatar"))?;

        self.blobs
            .open(&key)
            .await?
            .ok_or_else(|| CoreError::not_found("avatar"))
    }

    // -- Helpers --

    async fn load(&self, group_id: Uuid) -> CoreResult<Group> {
        blocking(&self.db, move |db| db.get_group(&group_id.to_string()))
            .await?
            .ok_or_else(|| CoreError::not_found("group"))
    }

    async fn member_group(&self, group_id: Uuid, user_id: Uuid) -> CoreResult<Group> {
        let group = self.load(group_id).await?;
        if !group.is_member(user_id) {
            return Err(CoreError::forbidden("not a member of this group"));
        }
        Ok(group)
    }

    /// Persist a group message. Ordinary messages start read by their sender.
    async fn post(
        &self,
        group: &Group,
        sender_id: Uuid,
        sender_name: &str,
        content: String,
        kind: MessageKind,
    ) -> CoreResult<Message> {
        let mut read_by = BTreeSet::new();
        if kind != MessageKind::System {
            read_by.insert(sender_id);
        }

        let message = Message {
            id: Uuid::new_v4(),
            room_id: group_room_id(group.id),
            sender_id,
            sender_name: sender_name.to_string(),
            recipient_id: None,
            group_id: Some(group.id),
            content,
            sent_at: Utc::now(),
            status: MessageStatus::Received,
            kind,
            attachment_key: None,
            deleted_for: BTreeSet::new(),
            read_by,
        };

        let stored = message.clone();
        blocking(&self.db, move |db| db.insert_message(&stored)).await?;
        Ok(message)
    }

    /// Record a SYSTEM message and send it to `audience`. No push, no ack.
    async fn system_message(
        &self,
        group: &Group,
        subject_id: Uuid,
        subject_name: &str,
        content: &str,
        audience: &BTreeSet<Uuid>,
    ) -> CoreResult<Message> {
        let message = self
            .post(group, subject_id, subject_name, content.to_string(), MessageKind::System)
            .await?;
        for member in audience {
            self.live
                .send_to_user(*member, LiveEvent::GroupMessage(message.clone()));
        }
        Ok(message)
    }

    fn notify_update(&self, group: &Group, removed: Option<Uuid>) {
        for member in group.member_ids.iter().copied().chain(removed) {
            self.live
                .send_to_user(member, LiveEvent::GroupUpdate(group.clone()));
        }
    }
}

fn valid_name(name: &str) -> CoreResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::bad_request("group name cannot be blank"));
    }
    Ok(name.to_string())
}

fn push_payload(group: &Group, message: &Message, recipient_id: Uuid) -> PushPayload {
    PushPayload {
        kind: "chat_message".to_string(),
        title: group.name.clone(),
        url: "/chat".to_string(),
        message_id: message.id,
        sender_id: message.sender_id,
        sender_name: message.sender_name.clone(),
        recipient_id,
        content: preview(message.kind, &message.content),
        group_id: Some(group.id),
        group_name: Some(group.name.clone()),
    }
}
