mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use threadly_api::middleware::verify_token;
use threadly_api::{AppStateInner, routes};
use threadly_core::{
    BlobStore, FsBlobStore, GroupCoordinator, MessageDeliveryCoordinator, ProfileEvents,
    PushDispatcher, PushNotifier, PushProvider, WebPushProvider,
};
use threadly_crypto::vapid::VapidSigner;
use threadly_db::Database;
use threadly_gateway::{Dispatcher, LiveChannel, PresenceTracker, connection};

use crate::config::{ServerConfig, VapidConfig};

#[derive(Clone)]
struct GatewayState {
    dispatcher: Dispatcher,
    presence: Arc<PresenceTracker>,
    jwt_secret: String,
}

#[derive(Deserialize)]
struct GatewayQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadly=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Storage
    let db = Arc::new(Database::open(&config.db_path)?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.blob_dir.clone()).await?);

    // Live channel + presence
    let dispatcher = Dispatcher::new();
    let live: Arc<dyn LiveChannel> = Arc::new(dispatcher.clone());
    let presence = Arc::new(PresenceTracker::new(live.clone(), config.heartbeat_ttl));
    let sweeper = presence.start_sweeper(config.sweep_interval);

    // Push
    let provider = match &config.vapid {
        Some(vapid) => Some(push_provider(vapid, &config)?),
        None => None,
    };
    let push = PushDispatcher::new(db.clone(), provider, config.push_timeout);
    let notifier: Arc<dyn PushNotifier> = Arc::new(push.clone());

    let delivery = MessageDeliveryCoordinator::new(
        db.clone(),
        presence.clone(),
        notifier.clone(),
        live.clone(),
        blobs.clone(),
        config.max_upload_bytes,
    );
    let groups = GroupCoordinator::new(
        db,
        presence.clone(),
        notifier,
        live.clone(),
        blobs,
        config.max_upload_bytes,
    );
    let profiles = ProfileEvents::new(live);

    let app_state = Arc::new(AppStateInner {
        delivery,
        groups,
        profiles,
        push,
        presence: presence.clone(),
        jwt_secret: config.jwt_secret.clone(),
    });

    let gateway_state = GatewayState {
        dispatcher,
        presence,
        jwt_secret: config.jwt_secret.clone(),
    };
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(routes::router(app_state, config.max_upload_bytes))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Threadly server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop().await;
    info!("Presence sweeper stopped");
    Ok(())
}

fn push_provider(vapid: &VapidConfig, config: &ServerConfig) -> anyhow::Result<Arc<dyn PushProvider>> {
    let signer = VapidSigner::from_base64(&vapid.private_key)?;
    if !vapid.public_key.is_empty() && vapid.public_key != signer.public_key() {
        warn!("THREADLY_VAPID_PUBLIC_KEY does not match the private key, using the derived key");
    }
    info!("Web Push enabled (subject {})", vapid.subject);
    let provider = WebPushProvider::new(signer, vapid.subject.clone(), config.push_timeout)?;
    Ok(Arc::new(provider))
}

/// Browsers cannot set headers on a WebSocket upgrade, so the token rides
/// in the query string.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(principal) = verify_token(&query.token, &state.jwt_secret) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            state.dispatcher,
            state.presence,
            principal.user_id,
            principal.username,
        )
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
