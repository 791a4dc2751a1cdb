use axum::{
    Router, middleware,
    routing::{get, post, put},
};

use crate::middleware::require_auth;
use crate::{AppState, messages, notifications, reactions, ws};

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/topics/{topic_id}/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route("/topics/{topic_id}/pins", get(messages::list_pinned))
        .route(
            "/messages/{message_id}",
            get(messages::get_message)
                .put(messages::edit_message)
                .delete(messages::delete_message),
        )
        .route(
            "/messages/{message_id}/reactions",
            post(reactions::toggle_reaction),
        )
        .route(
            "/messages/{message_id}/pin",
            put(messages::pin_message).delete(messages::unpin_message),
        )
        .route("/notifications", get(notifications::list_notifications))
        .route(
            "/notifications/{notification_id}/read",
            post(notifications::mark_read),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    // Authenticated inside the session so failures become close frames
    let ws_route = Router::new()
        .route("/topics/{topic_id}/ws", get(ws::subscribe))
        .with_state(state);

    Router::new().merge(protected_routes).merge(ws_route)
}
