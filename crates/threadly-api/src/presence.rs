use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use threadly_types::models::{PresenceEntry, PresenceStatus};

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    /// Last heartbeat while online. Cleared when the user goes offline.
    pub last_seen: Option<DateTime<Utc>>,
}

/// GET /presence: every tracked user.
pub async fn get_snapshot(State(state): State<AppState>) -> Json<Vec<PresenceEntry>> {
    Json(state.presence.snapshot())
}

/// GET /presence/{user_id}: unknown users read as offline.
pub async fn get_status(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        user_id,
        status: state.presence.get_status(user_id),
        last_seen: state.presence.last_seen(user_id),
    })
}
