pub mod chat;
pub mod error;
pub mod groups;
pub mod internal;
pub mod middleware;
pub mod presence;
pub mod push;
pub mod routes;

use std::sync::Arc;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};

use threadly_core::{
    BlobObject, GroupCoordinator, MessageDeliveryCoordinator, ProfileEvents, PushDispatcher,
};
use threadly_gateway::PresenceTracker;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub delivery: MessageDeliveryCoordinator,
    pub groups: GroupCoordinator,
    pub profiles: ProfileEvents,
    pub push: PushDispatcher,
    pub presence: Arc<PresenceTracker>,
    pub jwt_secret: String,
}

/// Stream a blob back with its content type.
pub(crate) fn blob_response(object: BlobObject) -> Response {
    let mut response = (
        [(header::CONTENT_TYPE, object.content_type)],
        Body::from_stream(object.stream),
    )
        .into_response();
    if let Some(size) = object.size {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, size.into());
    }
    response
}
