use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use threadly_core::Principal;
use threadly_types::api::{
    AddMembersRequest, CountResponse, CreateGroupRequest, PageQuery, RenameGroupRequest,
    SendGroupMessageRequest,
};
use threadly_types::models::{Group, GroupOverview, MessagePage};

use crate::error::{ApiError, ApiResult};
use crate::{AppState, blob_response};

/// POST /groups
pub async fn create_group(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<impl IntoResponse> {
    let group = state
        .groups
        .create(Some(&principal), &req.name, req.member_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// GET /groups
pub async fn list_groups(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<Vec<GroupOverview>>> {
    Ok(Json(state.groups.list_for_user(Some(&principal)).await?))
}

/// GET /groups/{id}
pub async fn get_group(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Group>> {
    Ok(Json(state.groups.get(Some(&principal), id).await?))
}

/// PUT /groups/{id}/name
pub async fn rename_group(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameGroupRequest>,
) -> ApiResult<Json<Group>> {
    Ok(Json(state.groups.rename(Some(&principal), id, &req.name).await?))
}

/// POST /groups/{id}/members
pub async fn add_members(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddMembersRequest>,
) -> ApiResult<Json<Group>> {
    let group = state
        .groups
        .add_members(Some(&principal), id, req.member_ids)
        .await?;
    Ok(Json(group))
}

/// DELETE /groups/{id}/members/{user_id}: also used to leave.
pub async fn remove_member(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Group>> {
    let group = state
        .groups
        .remove_member(Some(&principal), id, user_id)
        .await?;
    Ok(Json(group))
}

/// DELETE /groups/{id}
pub async fn delete_group(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.groups.delete(Some(&principal), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /groups/{id}/messages
pub async fn send_group_message(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendGroupMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .groups
        .send_message(Some(&principal), id, req.content, req.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /groups/{id}/messages
pub async fn get_group_messages(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<MessagePage>> {
    let page = state
        .groups
        .messages_page(Some(&principal), id, query.page, query.size)
        .await?;
    Ok(Json(page))
}

/// POST /groups/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CountResponse>> {
    let marked = state.groups.mark_read(Some(&principal), id).await?;
    Ok(Json(CountResponse {
        count: marked as u64,
    }))
}

/// POST /groups/{id}/mute: toggles.
pub async fn toggle_mute(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Group>> {
    Ok(Json(state.groups.toggle_mute(Some(&principal), id).await?))
}

/// PUT /groups/{id}/avatar: raw image body, type taken from Content-Type.
pub async fn upload_avatar(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    bytes: Bytes,
) -> ApiResult<Json<Group>> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Content-Type is required"))?;

    let group = state
        .groups
        .upload_avatar(Some(&principal), id, bytes, content_type)
        .await?;
    Ok(Json(group))
}

/// GET /groups/{id}/avatar
pub async fn get_avatar(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let object = state.groups.avatar(Some(&principal), id).await?;
    Ok(blob_response(object))
}
