use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post, put},
};

use crate::middleware::require_auth;
use crate::{AppState, chat, groups, internal, presence, push};

/// Multipart framing on top of the raw upload cap.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// REST routes. `/push/vapid-key` is public, everything else needs a token.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let public_routes = Router::new()
        .route("/push/vapid-key", get(push::get_vapid_key))
        .with_state(state.clone());

    let protected_routes = Router::new()
        // 1:1 messages
        .route("/messages", post(chat::send_message))
        .route("/messages/attachments", post(chat::send_attachment))
        .route("/messages/{id}", get(chat::get_message))
        .route("/messages/{id}/attachment", get(chat::get_attachment))
        .route(
            "/conversations/{contact_id}",
            get(chat::get_conversation).delete(chat::delete_conversation),
        )
        .route("/conversations/{contact_id}/page", get(chat::get_conversation_page))
        .route("/conversations/{contact_id}/media", get(chat::get_media_page))
        .route("/conversations/{contact_id}/unread", get(chat::get_unread_count))
        .route(
            "/conversations/{contact_id}/everyone",
            delete(chat::delete_conversation_for_both),
        )
        .route("/unread", get(chat::get_unread_counts))
        .route("/contacts", get(chat::get_contacts))
        .route("/contacts/status", get(chat::get_contact_statuses))
        // Groups
        .route("/groups", post(groups::create_group).get(groups::list_groups))
        .route("/groups/{id}", get(groups::get_group).delete(groups::delete_group))
        .route("/groups/{id}/name", put(groups::rename_group))
        .route("/groups/{id}/members", post(groups::add_members))
        .route("/groups/{id}/members/{user_id}", delete(groups::remove_member))
        .route(
            "/groups/{id}/messages",
            post(groups::send_group_message).get(groups::get_group_messages),
        )
        .route("/groups/{id}/read", post(groups::mark_read))
        .route("/groups/{id}/mute", post(groups::toggle_mute))
        .route(
            "/groups/{id}/avatar",
            put(groups::upload_avatar).get(groups::get_avatar),
        )
        // Presence
        .route("/presence", get(presence::get_snapshot))
        .route("/presence/{user_id}", get(presence::get_status))
        // Push
        .route("/push/subscribe", post(push::subscribe))
        .route("/push/unsubscribe", post(push::unsubscribe))
        .route("/push/subscriptions", delete(push::unsubscribe_all))
        // Events from other services
        .route("/internal/avatar-updated", post(internal::avatar_updated))
        .layer(DefaultBodyLimit::max(max_upload_bytes + MULTIPART_OVERHEAD))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use tower::ServiceExt;
    use uuid::Uuid;

    use threadly_core::{
        FsBlobStore, GroupCoordinator, MessageDeliveryCoordinator, ProfileEvents, PushDispatcher,
    };
    use threadly_db::Database;
    use threadly_gateway::{Dispatcher, LiveChannel, PresenceTracker};
    use threadly_types::api::Claims;
    use threadly_types::events::LiveEvent;
    use threadly_types::models::PresenceStatus;

    use super::*;
    use crate::AppStateInner;

    const SECRET: &str = "test-secret";

    async fn app() -> Router {
        app_with(Dispatcher::new()).await.0
    }

    async fn app_with(dispatcher: Dispatcher) -> (Router, Arc<PresenceTracker>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let live: Arc<dyn LiveChannel> = Arc::new(dispatcher);
        let presence = Arc::new(PresenceTracker::new(live.clone(), Duration::from_secs(90)));
        let blobs = Arc::new(
            FsBlobStore::new(std::env::temp_dir().join(format!("threadly-api-{}", Uuid::new_v4())))
                .await
                .unwrap(),
        );
        let push = PushDispatcher::new(db.clone(), None, Duration::from_secs(1));
        let notifier = Arc::new(push.clone());

        let state = Arc::new(AppStateInner {
            delivery: MessageDeliveryCoordinator::new(
                db.clone(),
                presence.clone(),
                notifier.clone(),
                live.clone(),
                blobs.clone(),
                1024,
            ),
            groups: GroupCoordinator::new(db, presence.clone(), notifier, live.clone(), blobs, 1024),
            profiles: ProfileEvents::new(live),
            push,
            presence: presence.clone(),
            jwt_secret: SECRET.into(),
        });
        (router(state, 1024), presence)
    }

    fn bearer(user_id: Uuid, username: &str) -> String {
        let claims = Claims {
            sub: user_id,
            username: username.into(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
        format!("Bearer {}", token)
    }

    fn json_request(method: &str, uri: &str, auth: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let response = app()
            .await
            .oneshot(json_request("GET", "/contacts", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn vapid_key_is_not_found_without_push() {
        let response = app()
            .await
            .oneshot(json_request("GET", "/push/vapid-key", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn send_message_creates_and_blank_group_is_rejected() {
        let app = app().await;
        let auth = bearer(Uuid::new_v4(), "alice");
        let bob = Uuid::new_v4();

        let body = format!(r#"{{"recipient_id":"{}","content":"hi"}}"#, bob);
        let response = app
            .clone()
            .oneshot(json_request("POST", "/messages", Some(&auth), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(json_request("POST", "/groups", Some(&auth), r#"{"name":"  "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subscribing_for_someone_else_is_forbidden() {
        let auth = bearer(Uuid::new_v4(), "alice");
        let body = format!(
            r#"{{"user_id":"{}","endpoint":"https://push.example/1","keys":{{"p256dh":"k","auth":"a"}}}}"#,
            Uuid::new_v4()
        );
        let response = app()
            .await
            .oneshot(json_request("POST", "/push/subscribe", Some(&auth), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn avatar_update_is_broadcast_to_connected_clients() {
        let dispatcher = Dispatcher::new();
        let mut client = dispatcher.subscribe();
        let (app, _) = app_with(dispatcher).await;
        let alice = Uuid::new_v4();
        let auth = bearer(alice, "alice");

        let body = format!(r#"{{"userId":"{}","avatarUrl":"https://cdn/a.png"}}"#, alice);
        let response = app
            .clone()
            .oneshot(json_request("POST", "/internal/avatar-updated", Some(&auth), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            client.try_recv().unwrap(),
            LiveEvent::AvatarUpdated {
                user_id: alice,
                avatar_url: "https://cdn/a.png".into()
            }
        );

        let blank = format!(r#"{{"user_id":"{}","avatar_url":" "}}"#, alice);
        let response = app
            .oneshot(json_request("POST", "/internal/avatar-updated", Some(&auth), &blank))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(client.try_recv().is_err());
    }

    #[tokio::test]
    async fn presence_status_reports_last_seen() {
        let (app, presence) = app_with(Dispatcher::new()).await;
        let auth = bearer(Uuid::new_v4(), "alice");
        let (online, offline) = (Uuid::new_v4(), Uuid::new_v4());
        presence.heartbeat(online);
        presence.set_status(offline, PresenceStatus::Offline);

        for (user, expect_seen) in [(online, true), (offline, false)] {
            let response = app
                .clone()
                .oneshot(json_request("GET", &format!("/presence/{}", user), Some(&auth), ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["last_seen"].is_string(), expect_seen);
        }
    }
}
