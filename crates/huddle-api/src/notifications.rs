use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use huddle_db::Database;
use huddle_types::api::Claims;
use huddle_types::models::{Message, NewNotification, Notification, NotificationType, Topic};

use crate::AppState;
use crate::error::{ApiError, ApiResult, blocking};

/// Longest notification body before it is cut and marked with an ellipsis.
pub const BODY_PREVIEW_CHARS: usize = 140;

const MENTION_TITLE: &str = "Mention";
const MENTION_BODY: &str = "You were mentioned in a message";

const DEFAULT_LIST_LIMIT: u32 = 20;
const MAX_LIST_LIMIT: u32 = 100;

/// Creates notification rows and serves each user's inbox.
///
/// Fan-out is best effort: a row that fails to insert is logged and skipped,
/// and the caller receives whatever was created.
#[derive(Clone)]
pub struct Notifications {
    db: Arc<Database>,
}

impl Notifications {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Tell every project member except `actor` about a new message.
    pub fn notify_new_message(&self, topic: &Topic, message: &Message, actor: Uuid) -> Vec<Notification> {
        let members = match self.db.member_ids(topic.project_id) {
            Ok(members) => members,
            Err(e) => {
                warn!("Could not resolve members of project {}: {}", topic.project_id, e);
                return vec![];
            }
        };

        let title = format!("New message in #{}", topic.name);
        let body = preview(&message.content);
        let link = format!("/projects/{}", topic.project_id);

        let recipients = members.into_iter().filter(|id| *id != actor);
        self.insert_all(recipients.map(|user_id| NewNotification {
            user_id,
            title: title.clone(),
            body: body.clone(),
            link: Some(link.clone()),
            kind: NotificationType::Message,
            message_id: Some(message.id),
        }))
    }

    /// One mention notification per distinct mentioned user, never the author.
    pub fn notify_mentions(&self, message: &Message, mentioned: &[Uuid]) -> Vec<Notification> {
        let mut recipients: Vec<Uuid> = Vec::with_capacity(mentioned.len());
        for id in mentioned {
            if Some(*id) != message.user_id && !recipients.contains(id) {
                recipients.push(*id);
            }
        }

        let link = format!("/topics/{}?message={}", message.topic_id, message.id);
        self.insert_all(recipients.into_iter().map(|user_id| NewNotification {
            user_id,
            title: MENTION_TITLE.to_string(),
            body: MENTION_BODY.to_string(),
            link: Some(link.clone()),
            kind: NotificationType::Mention,
            message_id: Some(message.id),
        }))
    }

    fn insert_all(&self, rows: impl Iterator<Item = NewNotification>) -> Vec<Notification> {
        let mut created = Vec::new();
        for row in rows {
            match self.db.insert_notification(&row) {
                Ok(Some(notification)) => created.push(notification),
                Ok(None) => debug!(
                    "Duplicate {} notification for {} skipped",
                    row.kind.as_str(),
                    row.user_id
                ),
                Err(e) => warn!(
                    "Failed to create {} notification for {}: {}",
                    row.kind.as_str(),
                    row.user_id,
                    e
                ),
            }
        }
        created
    }

    pub fn list(&self, user_id: Uuid, limit: Option<u32>, unread_only: bool) -> ApiResult<Vec<Notification>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.db.list_notifications(user_id, limit, unread_only)?)
    }

    pub fn mark_read(&self, id: Uuid, user_id: Uuid) -> ApiResult<Notification> {
        self.db
            .mark_notification_read(id, user_id)?
            .ok_or(ApiError::NotificationNotFound)
    }
}

/// Trim, then cut to [`BODY_PREVIEW_CHARS`] characters with a trailing `...`.
pub fn preview(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= BODY_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(BODY_PREVIEW_CHARS).collect();
    format!("{}...", cut.trim_end())
}

// -- HTTP handlers --

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub limit: Option<u32>,
    /// `1` or `true` restricts the list to unread notifications
    pub unread: Option<String>,
}

impl NotificationQuery {
    fn unread_only(&self) -> bool {
        matches!(self.unread.as_deref(), Some("1") | Some("true"))
    }
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let notifications = state.pipeline.notifications().clone();
    let unread_only = query.unread_only();
    let list = blocking(move || notifications.list(claims.sub, query.limit, unread_only)).await?;
    Ok(Json(list))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let notifications = state.pipeline.notifications().clone();
    let updated = blocking(move || notifications.mark_read(notification_id, claims.sub)).await?;
    Ok(Json(updated))
}
