use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use tracing::{debug, info, warn};
use uuid::Uuid;

use threadly_crypto::{decode_b64url, ece, vapid::VapidSigner};
use threadly_db::Database;
use threadly_types::api::PushPayload;
use threadly_types::models::{MessageKind, PushSubscription, SubscriptionKeys};

use crate::{CoreError, CoreResult, Principal, blocking, require};

/// How long a push service should keep an undelivered notification.
const PUSH_TTL_SECS: u32 = 24 * 60 * 60;

/// Text previews longer than this are cut and suffixed with an ellipsis.
const PREVIEW_MAX_CHARS: usize = 160;

/// Result of one delivery attempt against one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Subscription expired or was revoked by the browser
    Gone,
    /// Push service no longer accepts our VAPID key for it
    Forbidden,
    Failed(String),
}

impl PushOutcome {
    /// Terminal outcomes mean the subscription will never work again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Gone | Self::Forbidden)
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Delivered,
            404 | 410 => Self::Gone,
            403 => Self::Forbidden,
            other => Self::Failed(format!("push service returned {}", other)),
        }
    }
}

/// External push provider.
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &PushPayload) -> PushOutcome;

    /// Key browsers need to create a subscription for this provider.
    fn public_key(&self) -> Option<String> {
        None
    }
}

/// Fire-and-forget push seam used by the coordinators.
pub trait PushNotifier: Send + Sync {
    fn dispatch(&self, user_id: Uuid, payload: PushPayload);
}

/// Fixed preview for media kinds, literal (truncated) text otherwise.
pub fn preview(kind: MessageKind, content: &str) -> String {
    match kind {
        MessageKind::Voice => "🎤 Voice message".to_string(),
        MessageKind::Image => "📷 Photo".to_string(),
        MessageKind::Video => "🔵 Video message".to_string(),
        MessageKind::System => "ℹ️ Group update".to_string(),
        MessageKind::Text => {
            let text = content.trim();
            if text.is_empty() {
                return "New message".to_string();
            }
            match text.char_indices().nth(PREVIEW_MAX_CHARS) {
                Some((idx, _)) => format!("{}…", &text[..idx]),
                None => text.to_string(),
            }
        }
    }
}

/// Manages push subscriptions and delivers best-effort notifications.
#[derive(Clone)]
pub struct PushDispatcher {
    inner: Arc<PushDispatcherInner>,
}

struct PushDispatcherInner {
    db: Arc<Database>,
    /// `None` when push is not configured: dispatch becomes a no-op
    provider: Option<Arc<dyn PushProvider>>,
    timeout: Duration,
}

impl PushDispatcher {
    pub fn new(db: Arc<Database>, provider: Option<Arc<dyn PushProvider>>, timeout: Duration) -> Self {
        if provider.is_none() {
            warn!("Push notifications disabled (missing configuration)");
        }
        Self {
            inner: Arc::new(PushDispatcherInner {
                db,
                provider,
                timeout,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.provider.is_some()
    }

    pub fn public_key(&self) -> Option<String> {
        self.inner.provider.as_ref().and_then(|p| p.public_key())
    }

    // -- Subscriptions --

    /// Replace the subscription for `(user_id, endpoint)`.
    pub async fn upsert_subscription(&self, user_id: Uuid, endpoint: String, keys: SubscriptionKeys) -> CoreResult<()> {
        if endpoint.trim().is_empty() {
            return Err(CoreError::bad_request("endpoint is required"));
        }
        if keys.p256dh.trim().is_empty() || keys.auth.trim().is_empty() {
            return Err(CoreError::bad_request("subscription keys are required"));
        }

        blocking(&self.inner.db, move |db| {
            db.upsert_push_subscription(&user_id.to_string(), &endpoint, &keys.p256dh, &keys.auth)
        })
        .await?;
        debug!("Stored push subscription for {}", user_id);
        Ok(())
    }

    pub async fn remove_subscription(&self, user_id: Uuid, endpoint: String) -> CoreResult<usize> {
        blocking(&self.inner.db, move |db| {
            db.delete_push_subscription(&user_id.to_string(), &endpoint)
        })
        .await
    }

    pub async fn remove_all_subscriptions(&self, user_id: Uuid) -> CoreResult<usize> {
        blocking(&self.inner.db, move |db| {
            db.delete_push_subscriptions_for(&user_id.to_string())
        })
        .await
    }

    pub async fn subscriptions(&self, user_id: Uuid) -> CoreResult<Vec<PushSubscription>> {
        blocking(&self.inner.db, move |db| db.push_subscriptions_for(&user_id.to_string())).await
    }

    /// Subscribe on behalf of the caller. A caller may only register its own
    /// endpoints.
    pub async fn subscribe(
        &self,
        principal: Option<&Principal>,
        user_id: Uuid,
        endpoint: String,
        keys: SubscriptionKeys,
    ) -> CoreResult<()> {
        let principal = require(principal)?;
        if principal.user_id != user_id {
            return Err(CoreError::forbidden("cannot subscribe for another user"));
        }
        self.upsert_subscription(user_id, endpoint, keys).await
    }

    pub async fn unsubscribe(&self, principal: Option<&Principal>, user_id: Uuid, endpoint: String) -> CoreResult<()> {
        let principal = require(principal)?;
        if principal.user_id != user_id {
            return Err(CoreError::forbidden("cannot unsubscribe another user"));
        }
        self.remove_subscription(user_id, endpoint).await?;
        Ok(())
    }

    pub async fn unsubscribe_all(&self, principal: Option<&Principal>) -> CoreResult<usize> {
        let principal = require(principal)?;
        self.remove_all_subscriptions(principal.user_id).await
    }

    // -- Delivery --

    /// Attempt delivery to every subscription of `user_id`. Never fails:
    /// terminal outcomes prune the subscription, everything else is logged.
    pub async fn deliver(&self, user_id: Uuid, payload: PushPayload) {
        let Some(provider) = self.inner.provider.clone() else {
            debug!("Push disabled, skipping notification for {}", user_id);
            return;
        };

        let subscriptions = match self.subscriptions(user_id).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!("Failed to load push subscriptions for {}: {}", user_id, e);
                return;
            }
        };
        if subscriptions.is_empty() {
            debug!("No push subscriptions for {}", user_id);
            return;
        }

        let timeout = self.inner.timeout;
        let attempts = subscriptions.into_iter().map(|subscription| {
            let provider = provider.clone();
            let payload = &payload;
            async move {
                let outcome = match tokio::time::timeout(timeout, provider.send(&subscription, payload)).await {
                    Ok(outcome) => outcome,
                    Err(_) => PushOutcome::Failed(format!("timed out after {:?}", timeout)),
                };
                (subscription, outcome)
            }
        });

        for (subscription, outcome) in join_all(attempts).await {
            match outcome {
                PushOutcome::Delivered => {
                    debug!("Push delivered to {} via {}", user_id, subscription.endpoint);
                }
                PushOutcome::Gone | PushOutcome::Forbidden => {
                    info!(
                        "Removing dead push subscription for {} ({:?}): {}",
                        user_id, outcome, subscription.endpoint
                    );
                    if let Err(e) = self.remove_subscription(user_id, subscription.endpoint).await {
                        warn!("Failed to remove push subscription for {}: {}", user_id, e);
                    }
                }
                PushOutcome::Failed(reason) => {
                    warn!(
                        "Push to {} via {} failed: {}",
                        user_id, subscription.endpoint, reason
                    );
                }
            }
        }
    }
}

impl PushNotifier for PushDispatcher {
    /// Spawn delivery detached from the caller.
    fn dispatch(&self, user_id: Uuid, payload: PushPayload) {
        if !self.is_enabled() {
            debug!("Push disabled, skipping notification for {}", user_id);
            return;
        }
        let this = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { this.deliver(user_id, payload).await });
            }
            Err(_) => warn!("No runtime available, dropping push for {}", user_id),
        }
    }
}

/// Web Push (RFC 8030) with `aes128gcm` payloads and VAPID authorization.
pub struct WebPushProvider {
    client: reqwest::Client,
    signer: VapidSigner,
    subject: String,
}

impl WebPushProvider {
    pub fn new(signer: VapidSigner, subject: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build push HTTP client")?;
        Ok(Self {
            client,
            signer,
            subject: subject.into(),
        })
    }

    async fn try_send(&self, subscription: &PushSubscription, payload: &PushPayload) -> Result<u16> {
        let body = serde_json::to_vec(payload)?;
        let ua_public = decode_b64url(&subscription.keys.p256dh).context("bad p256dh key")?;
        let auth_secret = decode_b64url(&subscription.keys.auth).context("bad auth secret")?;
        let encrypted = ece::encrypt(&body, &ua_public, &auth_secret)?;

        let audience = reqwest::Url::parse(&subscription.endpoint)
            .context("bad endpoint URL")?
            .origin()
            .ascii_serialization();
        let authorization = self.signer.authorization(&audience, &self.subject)?;

        let response = self
            .client
            .post(&subscription.endpoint)
            .header("TTL", PUSH_TTL_SECS.to_string())
            .header(CONTENT_ENCODING, "aes128gcm")
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(AUTHORIZATION, authorization)
            .body(encrypted)
            .send()
            .await?;

        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl PushProvider for WebPushProvider {
    async fn send(&self, subscription: &PushSubscription, payload: &PushPayload) -> PushOutcome {
        match self.try_send(subscription, payload).await {
            Ok(status) => PushOutcome::from_status(status),
            Err(e) => PushOutcome::Failed(format!("{:#}", e)),
        }
    }

    fn public_key(&self) -> Option<String> {
        Some(self.signer.public_key().to_string())
    }
}
