use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
};

use threadly_core::{CoreError, Principal};
use threadly_types::api::{
    CountResponse, PushSubscribeRequest, PushUnsubscribeRequest, VapidKeyResponse,
};

use crate::AppState;
use crate::error::ApiResult;

/// GET /push/vapid-key: public, 404 when push is not configured.
pub async fn get_vapid_key(State(state): State<AppState>) -> ApiResult<Json<VapidKeyResponse>> {
    let public_key = state
        .push
        .public_key()
        .ok_or_else(|| CoreError::not_found("push configuration"))?;
    Ok(Json(VapidKeyResponse { public_key }))
}

/// POST /push/subscribe
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<PushSubscribeRequest>,
) -> ApiResult<StatusCode> {
    state
        .push
        .subscribe(Some(&principal), req.user_id, req.endpoint, req.keys)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /push/unsubscribe
pub async fn unsubscribe(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<PushUnsubscribeRequest>,
) -> ApiResult<StatusCode> {
    state
        .push
        .unsubscribe(Some(&principal), req.user_id, req.endpoint)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /push/subscriptions: drop every endpoint of the caller.
pub async fn unsubscribe_all(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<CountResponse>> {
    let removed = state.push.unsubscribe_all(Some(&principal)).await?;
    Ok(Json(CountResponse {
        count: removed as u64,
    }))
}
