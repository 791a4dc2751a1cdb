use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use huddle_types::api::{Claims, MessageQuery, SendMessageRequest, UpdateMessageRequest};

use crate::AppState;
use crate::error::{ApiResult, blocking};

pub async fn send_message(
    State(state): State<AppState>,
    Path(topic_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    let saved = blocking(move || pipeline.send(topic_id, claims.sub, req)).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(topic_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    let messages = blocking(move || pipeline.list(topic_id, claims.sub, &query)).await?;
    Ok(Json(messages))
}

pub async fn list_pinned(
    State(state): State<AppState>,
    Path(topic_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    let messages = blocking(move || pipeline.pinned(topic_id, claims.sub)).await?;
    Ok(Json(messages))
}

pub async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    let message = blocking(move || pipeline.get(message_id, claims.sub)).await?;
    Ok(Json(message))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    let message = blocking(move || pipeline.edit(message_id, claims.sub, &req.content)).await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    blocking(move || pipeline.delete(message_id, claims.sub)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pin_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    blocking(move || pipeline.pin(message_id, claims.sub)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpin_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    blocking(move || pipeline.unpin(message_id, claims.sub)).await?;
    Ok(StatusCode::NO_CONTENT)
}
