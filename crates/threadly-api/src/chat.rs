use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use threadly_core::Principal;
use threadly_types::api::{CountResponse, PageQuery, SendMessageRequest};
use threadly_types::models::{Message, MessageKind, MessagePage, PresenceStatus};

use crate::error::{ApiError, ApiResult};
use crate::{AppState, blob_response};

/// POST /messages
pub async fn send_message(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .delivery
        .send(Some(&principal), req.recipient_id, req.content, req.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /messages/attachments: multipart with `recipient_id`, `kind`,
/// optional `caption`, and the `file` part.
pub async fn send_attachment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut recipient_id = None;
    let mut kind = None;
    let mut caption = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "recipient_id" => {
                let text = field_text(field).await?;
                recipient_id = Some(
                    text.trim()
                        .parse::<Uuid>()
                        .map_err(|_| ApiError::bad_request("recipient_id is not a UUID"))?,
                );
            }
            "kind" => kind = Some(parse_kind(&field_text(field).await?)?),
            "caption" => caption = Some(field_text(field).await?),
            "file" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                file = Some((bytes, content_type));
            }
            _ => {}
        }
    }

    let recipient_id = recipient_id.ok_or_else(|| ApiError::bad_request("recipient_id is required"))?;
    let kind = kind.ok_or_else(|| ApiError::bad_request("kind is required"))?;
    let (bytes, content_type) = file.ok_or_else(|| ApiError::bad_request("file is required"))?;

    let message = state
        .delivery
        .send_attachment(Some(&principal), recipient_id, kind, bytes, &content_type, caption)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /messages/{id}
pub async fn get_message(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Message>> {
    Ok(Json(state.delivery.find_message(Some(&principal), id).await?))
}

/// GET /messages/{id}/attachment
pub async fn get_attachment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let object = state.delivery.attachment(Some(&principal), id).await?;
    Ok(blob_response(object))
}

/// GET /conversations/{contact_id}: full history, oldest first.
pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(contact_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Message>>> {
    let messages = state
        .delivery
        .fetch_conversation(Some(&principal), contact_id)
        .await?;
    Ok(Json(messages))
}

/// GET /conversations/{contact_id}/page
pub async fn get_conversation_page(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(contact_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<MessagePage>> {
    let page = state
        .delivery
        .conversation_page(Some(&principal), contact_id, query.page, query.size)
        .await?;
    Ok(Json(page))
}

/// GET /conversations/{contact_id}/media
pub async fn get_media_page(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(contact_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<MessagePage>> {
    let page = state
        .delivery
        .media_page(Some(&principal), contact_id, query.page, query.size)
        .await?;
    Ok(Json(page))
}

/// GET /conversations/{contact_id}/unread
pub async fn get_unread_count(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(contact_id): Path<Uuid>,
) -> ApiResult<Json<CountResponse>> {
    let count = state
        .delivery
        .count_unread(Some(&principal), contact_id)
        .await?;
    Ok(Json(CountResponse { count }))
}

/// DELETE /conversations/{contact_id}: hide for the caller only.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(contact_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .delivery
        .delete_for_user(Some(&principal), contact_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /conversations/{contact_id}/everyone
pub async fn delete_conversation_for_both(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(contact_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .delivery
        .delete_for_both(Some(&principal), contact_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /unread
pub async fn get_unread_counts(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<HashMap<Uuid, u64>>> {
    Ok(Json(state.delivery.unread_counts(Some(&principal)).await?))
}

/// GET /contacts
pub async fn get_contacts(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<Vec<Uuid>>> {
    Ok(Json(state.delivery.contacts(Some(&principal)).await?))
}

/// GET /contacts/status
pub async fn get_contact_statuses(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<HashMap<Uuid, PresenceStatus>>> {
    Ok(Json(state.delivery.contact_statuses(Some(&principal)).await?))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// Accepts the wire names (`IMAGE`, `voice`, `VIDEO_CIRCLE`, ...).
fn parse_kind(raw: &str) -> ApiResult<MessageKind> {
    let value = serde_json::Value::String(raw.trim().to_ascii_uppercase());
    serde_json::from_value(value).map_err(|_| ApiError::bad_request(format!("unknown message kind '{}'", raw)))
}
