use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
};

use threadly_core::Principal;
use threadly_types::api::AvatarUpdatedRequest;

use crate::AppState;
use crate::error::ApiResult;

/// POST /internal/avatar-updated: relay an avatar change to every client.
pub async fn avatar_updated(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<AvatarUpdatedRequest>,
) -> ApiResult<StatusCode> {
    state
        .profiles
        .avatar_updated(Some(&principal), req.user_id, &req.avatar_url)?;
    Ok(StatusCode::ACCEPTED)
}
