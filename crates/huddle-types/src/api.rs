use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageType, ReactionGroup};

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the live-subscription
/// handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: Option<MessageType>,
    /// Opaque JSON. May carry `{"mentions": [{"id": ...}]}`.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
}

/// Paging and search over a topic's history. Newest first.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Exclusive `created_at` cursor from the previous page
    pub before: Option<DateTime<Utc>>,
    /// Case-insensitive substring search when non-empty
    pub q: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMessageRequest {
    pub content: String,
}

// -- Reactions --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleReactionResponse {
    pub message_id: Uuid,
    pub reactions: Vec<ReactionGroup>,
}
