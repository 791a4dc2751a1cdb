use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageWithUser, Notification, ReactionGroup};

/// Events pushed to subscribers of a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was posted (or generated by a command)
    NewMessage { message: MessageWithUser },

    /// A message's content was edited
    MessageUpdated { message: MessageWithUser },

    /// A message was removed
    MessageDeleted { message_id: Uuid },

    /// The reaction set on a message changed
    ReactionUpdated {
        message_id: Uuid,
        reactions: Vec<ReactionGroup>,
    },

    /// Someone in the topic started or stopped typing
    Typing {
        user_id: Uuid,
        name: String,
        is_typing: bool,
    },

    /// A notification row was created for one of the project's members
    NotificationCreated { notification: Notification },

    /// Reply to a client `ping`
    Pong,
}

impl ServerEvent {
    /// Wire tag of this event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionUpdated { .. } => "reaction_updated",
            Self::Typing { .. } => "typing",
            Self::NotificationCreated { .. } => "notification_created",
            Self::Pong => "pong",
        }
    }
}

/// Control frames sent FROM client TO server over a live subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Relayed to the other subscribers of the topic with the sender's identity
    Typing {
        #[serde(default = "default_is_typing")]
        is_typing: bool,
    },

    /// Answered with a `pong` on the same connection
    Ping,
}

fn default_is_typing() -> bool {
    true
}
