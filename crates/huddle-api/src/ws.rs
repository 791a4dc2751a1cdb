use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use serde::Deserialize;
use uuid::Uuid;

use huddle_gateway::session::handle_socket;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub token: Option<String>,
}

/// Upgrade to a live subscription on one topic. The credential is checked
/// by the session itself so failures arrive as close frames.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(topic_id): Path<Uuid>,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let credential = query.token.or_else(|| {
        headers
            .typed_get::<Authorization<Bearer>>()
            .map(|auth| auth.token().to_string())
    });
    let ctx = state.session.clone();

    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, ctx, topic_id, credential).await;
    })
}
