//! The message pipeline: every write to a topic's history goes through here.
//!
//! Each operation checks membership or authorship first, then commits to
//! storage, then hands the committed state to the hub. Nothing is broadcast
//! that was not stored, and a failed check leaves no trace.
//!
//! Operations are synchronous. HTTP handlers run them on the blocking pool.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use huddle_db::Database;
use huddle_gateway::{Hub, TopicAccess};
use huddle_types::api::{MessageQuery, SendMessageRequest};
use huddle_types::events::ServerEvent;
use huddle_types::models::{
    Message, MessageType, MessageWithUser, Notification, ReactionGroup, Topic,
};

use crate::commands::{CommandAction, interpret, parse_command};
use crate::error::{ApiError, ApiResult};
use crate::mentions::MentionPayload;
use crate::notifications::Notifications;
use crate::reactions::{aggregate, aggregate_by_message};

pub const MAX_CONTENT_CHARS: usize = 10_000;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;
const MAX_EMOJI_CHARS: usize = 16;

pub struct MessagePipeline {
    db: Arc<Database>,
    hub: Hub,
    notifications: Notifications,
}

impl MessagePipeline {
    pub fn new(db: Arc<Database>, hub: Hub) -> Self {
        Self {
            notifications: Notifications::new(db.clone()),
            db,
            hub,
        }
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    // -- Writes --

    /// Post to a topic. Slash commands are interpreted here and may store a
    /// system message in place of the user's text.
    pub fn send(
        &self,
        topic_id: Uuid,
        author: Uuid,
        req: SendMessageRequest,
    ) -> ApiResult<MessageWithUser> {
        let mut topic = self.topic(topic_id)?;
        self.require_member(&topic, author)?;

        validate_content(&req.content)?;
        let kind = req.kind.unwrap_or_default();
        if kind == MessageType::System {
            return Err(ApiError::InvalidInput(
                "system messages cannot be sent directly".into(),
            ));
        }
        for reference in [req.parent_id, req.reply_to_id].into_iter().flatten() {
            self.require_in_topic(reference, topic_id)?;
        }

        let now = Utc::now();
        let mut message = Message {
            id: Uuid::new_v4(),
            topic_id,
            user_id: Some(author),
            content: req.content,
            kind,
            metadata: req.metadata,
            parent_id: req.parent_id,
            reply_to_id: req.reply_to_id,
            created_at: now,
            updated_at: now,
        };

        // Commands run before anything is stored; a failing command stores nothing
        let action = match parse_command(&message.content) {
            Some(command) => Some(interpret(&command)?),
            None => None,
        };

        match action {
            None => self.db.insert_message(&message)?,
            Some(CommandAction::Rewrite(content)) => {
                validate_content(&content)?;
                message.content = content;
                message.kind = MessageType::Text;
                self.db.insert_message(&message)?;
            }
            Some(CommandAction::RenameTopic { name, announcement }) => {
                message = system_message(topic_id, announcement);
                self.db.rename_topic(topic_id, &name, &message)?;
                info!("Topic {} renamed to {:?} by {}", topic_id, name, author);
                topic.name = name;
            }
            Some(CommandAction::Announce(announcement)) => {
                message = system_message(topic_id, announcement);
                self.db.insert_message(&message)?;
            }
        }

        // Best effort from here on: notification failures are logged, not returned
        let mut created: Vec<Notification> = Vec::new();
        if message.user_id.is_some() {
            let mentioned = MentionPayload::from_metadata(message.metadata.as_ref()).user_ids();
            if !mentioned.is_empty() {
                created.extend(self.notifications.notify_mentions(&message, &mentioned));
            }
        }
        created.extend(self.notifications.notify_new_message(&topic, &message, author));

        let saved = self
            .db
            .get_message(message.id)?
            .ok_or(ApiError::MessageNotFound)?;

        self.hub.broadcast(
            topic_id,
            &ServerEvent::NewMessage {
                message: saved.clone(),
            },
        );
        for notification in created {
            self.hub
                .broadcast(topic_id, &ServerEvent::NotificationCreated { notification });
        }

        debug!("Message {} stored in topic {}", saved.message.id, topic_id);
        Ok(saved)
    }

    /// Author only.
    pub fn edit(&self, message_id: Uuid, editor: Uuid, content: &str) -> ApiResult<MessageWithUser> {
        validate_content(content)?;
        let (current, _topic) = self.message(message_id)?;
        if current.message.user_id != Some(editor) {
            return Err(ApiError::NotAuthor);
        }

        if !self.db.update_message_content(message_id, content, Utc::now())? {
            return Err(ApiError::MessageNotFound);
        }

        let updated = self.decorate_one(
            self.db
                .get_message(message_id)?
                .ok_or(ApiError::MessageNotFound)?,
            editor,
        )?;
        self.hub.broadcast(
            updated.message.topic_id,
            &ServerEvent::MessageUpdated {
                message: updated.clone(),
            },
        );
        Ok(updated)
    }

    /// The author, or a project owner/admin. The role is read on every call.
    pub fn delete(&self, message_id: Uuid, requester: Uuid) -> ApiResult<()> {
        let (current, topic) = self.message(message_id)?;
        if current.message.user_id != Some(requester) {
            let role = self.db.member_role(topic.project_id, requester)?;
            if !role.is_some_and(|r| r.can_moderate()) {
                return Err(ApiError::NotAuthor);
            }
        }

        if !self.db.delete_message(message_id)? {
            return Err(ApiError::MessageNotFound);
        }

        info!("Message {} deleted by {}", message_id, requester);
        self.hub
            .broadcast(topic.id, &ServerEvent::MessageDeleted { message_id });
        Ok(())
    }

    /// Add the reaction if absent, remove it if present. Returns the groups
    /// as `user` now sees them.
    pub fn toggle_reaction(
        &self,
        message_id: Uuid,
        user: Uuid,
        emoji: &str,
    ) -> ApiResult<Vec<ReactionGroup>> {
        let emoji = validate_emoji(emoji)?;
        let (_current, topic) = self.message(message_id)?;
        self.require_member(&topic, user)?;

        let added = self.db.toggle_reaction(message_id, user, emoji)?;
        debug!(
            "Reaction {} {} on {} by {}",
            emoji,
            if added { "added" } else { "removed" },
            message_id,
            user
        );

        let reactions = aggregate(&self.db.get_reactions(message_id)?, user);
        self.hub.broadcast(
            topic.id,
            &ServerEvent::ReactionUpdated {
                message_id,
                reactions: reactions.clone(),
            },
        );
        Ok(reactions)
    }

    /// Any member may pin. Pinning twice is a no-op.
    pub fn pin(&self, message_id: Uuid, user: Uuid) -> ApiResult<()> {
        let (_current, topic) = self.message(message_id)?;
        self.require_member(&topic, user)?;
        if self.db.pin_message(topic.id, message_id)? {
            debug!("Message {} pinned in topic {}", message_id, topic.id);
        }
        Ok(())
    }

    /// Unpinning a message that is not pinned is a no-op.
    pub fn unpin(&self, message_id: Uuid, user: Uuid) -> ApiResult<()> {
        let (_current, topic) = self.message(message_id)?;
        self.require_member(&topic, user)?;
        if self.db.unpin_message(topic.id, message_id)? {
            debug!("Message {} unpinned in topic {}", message_id, topic.id);
        }
        Ok(())
    }

    // -- Reads --

    pub fn get(&self, message_id: Uuid, viewer: Uuid) -> ApiResult<MessageWithUser> {
        let (current, topic) = self.message(message_id)?;
        self.require_member(&topic, viewer)?;
        self.decorate_one(current, viewer)
    }

    /// Newest first. A non-empty `q` switches to a content search.
    pub fn list(
        &self,
        topic_id: Uuid,
        viewer: Uuid,
        query: &MessageQuery,
    ) -> ApiResult<Vec<MessageWithUser>> {
        let topic = self.topic(topic_id)?;
        self.require_member(&topic, viewer)?;

        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let rows = match query.q.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => self.db.search_messages(topic_id, q, limit)?,
            _ => self.db.list_messages(
                topic_id,
                limit,
                query.offset.unwrap_or(0),
                query.before,
            )?,
        };
        self.decorate(rows, viewer)
    }

    pub fn pinned(&self, topic_id: Uuid, viewer: Uuid) -> ApiResult<Vec<MessageWithUser>> {
        let topic = self.topic(topic_id)?;
        self.require_member(&topic, viewer)?;
        let rows = self.db.list_pinned(topic_id)?;
        self.decorate(rows, viewer)
    }

    // -- Helpers --

    fn topic(&self, topic_id: Uuid) -> ApiResult<Topic> {
        self.db.get_topic(topic_id)?.ok_or(ApiError::TopicNotFound)
    }

    fn message(&self, message_id: Uuid) -> ApiResult<(MessageWithUser, Topic)> {
        let current = self
            .db
            .get_message(message_id)?
            .ok_or(ApiError::MessageNotFound)?;
        let topic = self.topic(current.message.topic_id)?;
        Ok((current, topic))
    }

    fn require_member(&self, topic: &Topic, user: Uuid) -> ApiResult<()> {
        if self.db.is_member(topic.project_id, user)? {
            Ok(())
        } else {
            Err(ApiError::NotAMember)
        }
    }

    /// Thread references must name a stored message in the same topic.
    fn require_in_topic(&self, message_id: Uuid, topic_id: Uuid) -> ApiResult<()> {
        let referenced = self
            .db
            .get_message(message_id)?
            .ok_or(ApiError::MessageNotFound)?;
        if referenced.message.topic_id != topic_id {
            return Err(ApiError::InvalidInput(
                "referenced message belongs to another topic".into(),
            ));
        }
        Ok(())
    }

    fn decorate_one(&self, message: MessageWithUser, viewer: Uuid) -> ApiResult<MessageWithUser> {
        let mut decorated = self.decorate(vec![message], viewer)?;
        decorated.pop().ok_or(ApiError::MessageNotFound)
    }

    /// Attach reaction groups computed for `viewer`.
    fn decorate(
        &self,
        mut messages: Vec<MessageWithUser>,
        viewer: Uuid,
    ) -> ApiResult<Vec<MessageWithUser>> {
        let ids: Vec<Uuid> = messages.iter().map(|m| m.message.id).collect();
        let rows = self.db.get_reactions_for_messages(&ids)?;
        let mut groups = aggregate_by_message(&rows, viewer);
        for message in &mut messages {
            message.reactions = groups.remove(&message.message.id).unwrap_or_default();
        }
        Ok(messages)
    }
}

impl TopicAccess for MessagePipeline {
    /// A topic that does not exist is simply not readable.
    fn can_read_topic(&self, user_id: Uuid, topic_id: Uuid) -> anyhow::Result<bool> {
        match self.db.get_topic(topic_id)? {
            Some(topic) => self.db.is_member(topic.project_id, user_id),
            None => Ok(false),
        }
    }
}

fn system_message(topic_id: Uuid, content: String) -> Message {
    let now = Utc::now();
    Message {
        id: Uuid::new_v4(),
        topic_id,
        user_id: None,
        content,
        kind: MessageType::System,
        metadata: None,
        parent_id: None,
        reply_to_id: None,
        created_at: now,
        updated_at: now,
    }
}

fn validate_content(content: &str) -> ApiResult<()> {
    if content.trim().is_empty() {
        return Err(ApiError::InvalidInput("content must not be empty".into()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::InvalidInput(format!(
            "content must be at most {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(())
}

fn validate_emoji(emoji: &str) -> ApiResult<&str> {
    let emoji = emoji.trim();
    if emoji.is_empty()
        || emoji.chars().count() > MAX_EMOJI_CHARS
        || emoji.chars().any(char::is_whitespace)
    {
        return Err(ApiError::InvalidInput("malformed emoji".into()));
    }
    Ok(emoji)
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_db::Database;
    use huddle_gateway::hub::DEFAULT_QUEUE_CAPACITY;
    use huddle_types::models::{NotificationType, ProjectRole};
    use serde_json::json;

    struct Fixture {
        pipeline: MessagePipeline,
        db: Arc<Database>,
        project: Uuid,
        topic: Uuid,
        owner: Uuid,
        member: Uuid,
        outsider: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let owner = Uuid::new_v4();
        let member = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        db.create_user(owner, "Avery", "avery@example.com", None).unwrap();
        db.create_user(member, "Blake", "blake@example.com", None).unwrap();
        db.create_user(outsider, "Casey", "casey@example.com", None).unwrap();

        let project = Uuid::new_v4();
        db.create_project(project, "Launch", owner).unwrap();
        db.set_member_role(project, member, ProjectRole::Member).unwrap();

        let topic = Uuid::new_v4();
        db.create_topic(topic, project, "general").unwrap();

        Fixture {
            pipeline: MessagePipeline::new(db.clone(), Hub::spawn(DEFAULT_QUEUE_CAPACITY)),
            db,
            project,
            topic,
            owner,
            member,
            outsider,
        }
    }

    fn text(content: &str) -> SendMessageRequest {
        SendMessageRequest {
            content: content.to_string(),
            kind: None,
            metadata: None,
            parent_id: None,
            reply_to_id: None,
        }
    }

    fn history(f: &Fixture) -> Vec<MessageWithUser> {
        f.db.list_messages(f.topic, 100, 0, None).unwrap()
    }

    #[tokio::test]
    async fn hello_is_stored_and_other_members_notified() {
        let f = fixture();
        let saved = f.pipeline.send(f.topic, f.owner, text("hello")).unwrap();

        assert_eq!(saved.message.content, "hello");
        assert_eq!(saved.message.kind, MessageType::Text);
        assert_eq!(saved.message.user_id, Some(f.owner));
        assert_eq!(saved.user.as_ref().unwrap().name, "Avery");
        assert!(saved.reactions.is_empty());

        let inbox = f.db.list_notifications(f.member, 10, false).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, NotificationType::Message);
        assert!(inbox[0].link.as_deref().unwrap().contains(&f.project.to_string()));
        assert!(f.db.list_notifications(f.owner, 10, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn shrug_rewrites_content() {
        let f = fixture();
        let saved = f.pipeline.send(f.topic, f.owner, text("/shrug nevermind")).unwrap();
        assert_eq!(saved.message.content, r"nevermind ¯\_(ツ)_/¯");
        assert_eq!(saved.message.kind, MessageType::Text);
    }

    #[tokio::test]
    async fn outsider_cannot_post_or_run_commands() {
        let f = fixture();
        for content in ["hello", "/topic hijacked"] {
            assert!(matches!(
                f.pipeline.send(f.topic, f.outsider, text(content)),
                Err(ApiError::NotAMember)
            ));
        }
        assert!(history(&f).is_empty());
        assert_eq!(f.db.get_topic(f.topic).unwrap().unwrap().name, "general");
        assert!(f.db.list_notifications(f.owner, 10, false).unwrap().is_empty());
        assert!(f.db.list_notifications(f.member, 10, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_commands_store_nothing() {
        let f = fixture();
        assert!(matches!(
            f.pipeline.send(f.topic, f.owner, text("/topic ")),
            Err(ApiError::InvalidCommand(_))
        ));
        assert!(matches!(
            f.pipeline.send(f.topic, f.owner, text("/frobnicate")),
            Err(ApiError::UnknownCommand(_))
        ));
        assert!(history(&f).is_empty());
        assert_eq!(f.db.get_topic(f.topic).unwrap().unwrap().name, "general");
    }

    #[tokio::test]
    async fn topic_command_renames_and_announces() {
        let f = fixture();
        let saved = f
            .pipeline
            .send(f.topic, f.member, text("/topic Release planning"))
            .unwrap();

        assert_eq!(saved.message.kind, MessageType::System);
        assert_eq!(saved.message.user_id, None);
        assert!(saved.user.is_none());
        assert_eq!(saved.message.content, "Topic renamed to \"Release planning\"");
        assert_eq!(
            f.db.get_topic(f.topic).unwrap().unwrap().name,
            "Release planning"
        );

        // The invoker is not notified about their own rename
        let inbox = f.db.list_notifications(f.owner, 10, false).unwrap();
        assert_eq!(inbox[0].title, "New message in #Release planning");
        assert!(f.db.list_notifications(f.member, 10, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn invite_command_stores_system_message() {
        let f = fixture();
        let saved = f.pipeline.send(f.topic, f.owner, text("/invite @dana")).unwrap();
        assert_eq!(saved.message.kind, MessageType::System);
        assert_eq!(saved.message.content, "Invitation sent to @dana");
        assert_eq!(history(&f).len(), 1);
    }

    #[tokio::test]
    async fn shrug_result_respects_length_limit() {
        let f = fixture();
        // Fits before the rewrite, overflows once the shrug is appended
        let padded = format!("/shrug {}", "x".repeat(MAX_CONTENT_CHARS - 7));
        assert!(padded.chars().count() <= MAX_CONTENT_CHARS);
        assert!(matches!(
            f.pipeline.send(f.topic, f.owner, text(&padded)),
            Err(ApiError::InvalidInput(_))
        ));
        assert!(history(&f).is_empty());
        assert!(f.db.list_notifications(f.member, 10, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn thread_references_must_exist_in_same_topic() {
        let f = fixture();
        let root = f.pipeline.send(f.topic, f.owner, text("root")).unwrap();

        let mut reply = text("reply");
        reply.parent_id = Some(root.message.id);
        reply.reply_to_id = Some(root.message.id);
        let saved = f.pipeline.send(f.topic, f.member, reply).unwrap();
        assert_eq!(saved.message.parent_id, Some(root.message.id));
        assert_eq!(saved.message.reply_to_id, Some(root.message.id));

        let mut dangling = text("into the void");
        dangling.parent_id = Some(Uuid::new_v4());
        assert!(matches!(
            f.pipeline.send(f.topic, f.owner, dangling),
            Err(ApiError::MessageNotFound)
        ));

        // A topic in a project the member cannot see
        let elsewhere = Uuid::new_v4();
        let other_project = Uuid::new_v4();
        f.db.create_project(other_project, "Secret", f.outsider).unwrap();
        f.db.create_topic(elsewhere, other_project, "private").unwrap();
        let hidden = f.pipeline.send(elsewhere, f.outsider, text("hidden")).unwrap();

        for cross in [
            SendMessageRequest {
                parent_id: Some(hidden.message.id),
                ..text("cross parent")
            },
            SendMessageRequest {
                reply_to_id: Some(hidden.message.id),
                ..text("cross reply")
            },
        ] {
            assert!(matches!(
                f.pipeline.send(f.topic, f.member, cross),
                Err(ApiError::InvalidInput(_))
            ));
        }

        // Same project, different topic
        let sibling = Uuid::new_v4();
        f.db.create_topic(sibling, f.project, "random").unwrap();
        let mut sideways = text("sideways");
        sideways.parent_id = Some(root.message.id);
        assert!(matches!(
            f.pipeline.send(sibling, f.owner, sideways),
            Err(ApiError::InvalidInput(_))
        ));

        assert_eq!(history(&f).len(), 2);
        assert!(f.db.list_messages(sibling, 10, 0, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn content_and_type_are_validated() {
        let f = fixture();
        assert!(matches!(
            f.pipeline.send(f.topic, f.owner, text("   ")),
            Err(ApiError::InvalidInput(_))
        ));
        assert!(matches!(
            f.pipeline
                .send(f.topic, f.owner, text(&"x".repeat(MAX_CONTENT_CHARS + 1))),
            Err(ApiError::InvalidInput(_))
        ));

        let mut forged = text("I am the system now");
        forged.kind = Some(MessageType::System);
        assert!(matches!(
            f.pipeline.send(f.topic, f.owner, forged),
            Err(ApiError::InvalidInput(_))
        ));

        let mut code = text("fn main() {}");
        code.kind = Some(MessageType::Code);
        let saved = f.pipeline.send(f.topic, f.owner, code).unwrap();
        assert_eq!(saved.message.kind, MessageType::Code);

        assert!(matches!(
            f.pipeline.send(Uuid::new_v4(), f.owner, text("hi")),
            Err(ApiError::TopicNotFound)
        ));
    }

    #[tokio::test]
    async fn mentions_create_notifications_and_bad_metadata_is_ignored() {
        let f = fixture();
        let mut req = text("@blake look");
        req.metadata = Some(json!({
            "mentions": [{ "id": f.member }, { "id": f.owner }, { "id": f.member }]
        }));
        f.pipeline.send(f.topic, f.owner, req).unwrap();

        let inbox = f.db.list_notifications(f.member, 10, false).unwrap();
        let mentions: Vec<_> = inbox
            .iter()
            .filter(|n| n.kind == NotificationType::Mention)
            .collect();
        assert_eq!(mentions.len(), 1);
        assert_eq!(inbox.len(), 2);
        assert!(f.db.list_notifications(f.owner, 10, false).unwrap().is_empty());

        let mut garbled = text("still delivered");
        garbled.metadata = Some(json!({ "mentions": "everyone" }));
        let saved = f.pipeline.send(f.topic, f.owner, garbled).unwrap();
        assert_eq!(saved.message.content, "still delivered");
    }

    #[tokio::test]
    async fn only_author_edits() {
        let f = fixture();
        let saved = f.pipeline.send(f.topic, f.member, text("draft")).unwrap();
        let id = saved.message.id;

        // Even the owner cannot edit someone else's words
        assert!(matches!(
            f.pipeline.edit(id, f.owner, "rewritten"),
            Err(ApiError::NotAuthor)
        ));

        let edited = f.pipeline.edit(id, f.member, "final").unwrap();
        assert_eq!(edited.message.content, "final");
        assert!(edited.message.updated_at >= saved.message.updated_at);

        assert!(matches!(
            f.pipeline.edit(Uuid::new_v4(), f.member, "x"),
            Err(ApiError::MessageNotFound)
        ));
    }

    #[tokio::test]
    async fn delete_allows_author_or_moderator_checked_per_call() {
        let f = fixture();
        let by_owner = f.pipeline.send(f.topic, f.owner, text("one")).unwrap();
        let by_member = f.pipeline.send(f.topic, f.member, text("two")).unwrap();
        let another = f.pipeline.send(f.topic, f.owner, text("three")).unwrap();

        // Plain member cannot delete the owner's message
        assert!(matches!(
            f.pipeline.delete(by_owner.message.id, f.member),
            Err(ApiError::NotAuthor)
        ));
        assert!(matches!(
            f.pipeline.delete(by_owner.message.id, f.outsider),
            Err(ApiError::NotAuthor)
        ));

        // Author may delete their own
        f.pipeline.delete(by_member.message.id, f.member).unwrap();
        // Owner may delete anyone's
        f.pipeline.delete(by_owner.message.id, f.owner).unwrap();

        // Promotion takes effect on the next call
        f.db.set_member_role(f.project, f.member, ProjectRole::Admin).unwrap();
        f.pipeline.delete(another.message.id, f.member).unwrap();

        assert!(history(&f).is_empty());
        assert!(matches!(
            f.pipeline.delete(another.message.id, f.owner),
            Err(ApiError::MessageNotFound)
        ));
    }

    #[tokio::test]
    async fn toggling_twice_restores_reactions() {
        let f = fixture();
        let id = f.pipeline.send(f.topic, f.owner, text("vote")).unwrap().message.id;

        let after_add = f.pipeline.toggle_reaction(id, f.member, "👍").unwrap();
        assert_eq!(after_add.len(), 1);
        assert!(after_add[0].has_self);

        let after_remove = f.pipeline.toggle_reaction(id, f.member, "👍").unwrap();
        assert!(after_remove.is_empty());

        assert!(matches!(
            f.pipeline.toggle_reaction(id, f.outsider, "👍"),
            Err(ApiError::NotAMember)
        ));
        assert!(matches!(
            f.pipeline.toggle_reaction(id, f.member, "  "),
            Err(ApiError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn pin_is_idempotent_and_member_only() {
        let f = fixture();
        let id = f.pipeline.send(f.topic, f.owner, text("keep")).unwrap().message.id;

        // Any member may pin, not just the author
        f.pipeline.pin(id, f.member).unwrap();
        f.pipeline.pin(id, f.member).unwrap();
        assert_eq!(f.db.pinned_count(f.topic).unwrap(), 1);
        assert_eq!(f.pipeline.pinned(f.topic, f.owner).unwrap().len(), 1);

        f.pipeline.unpin(id, f.owner).unwrap();
        f.pipeline.unpin(id, f.owner).unwrap();
        assert_eq!(f.db.pinned_count(f.topic).unwrap(), 0);

        assert!(matches!(f.pipeline.pin(id, f.outsider), Err(ApiError::NotAMember)));
    }

    #[tokio::test]
    async fn reads_are_member_only_and_carry_viewer_reactions() {
        let f = fixture();
        let id = f.pipeline.send(f.topic, f.owner, text("read me")).unwrap().message.id;
        f.pipeline.send(f.topic, f.owner, text("another one")).unwrap();
        f.pipeline.toggle_reaction(id, f.owner, "🎉").unwrap();

        let as_member = f.pipeline.get(id, f.member).unwrap();
        assert_eq!(as_member.reactions.len(), 1);
        assert!(!as_member.reactions[0].has_self);
        assert!(f.pipeline.get(id, f.owner).unwrap().reactions[0].has_self);

        assert!(matches!(f.pipeline.get(id, f.outsider), Err(ApiError::NotAMember)));

        let page = f
            .pipeline
            .list(f.topic, f.member, &MessageQuery::default())
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message.content, "another one");

        let found = f
            .pipeline
            .list(
                f.topic,
                f.member,
                &MessageQuery {
                    q: Some("READ".into()),
                    ..MessageQuery::default()
                },
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message.id, id);
        assert_eq!(found[0].reactions.len(), 1);
    }

    #[tokio::test]
    async fn send_broadcasts_message_then_notifications() {
        let f = fixture();
        let mut sub = f.pipeline.hub().register(f.topic, f.member);
        let saved = f.pipeline.send(f.topic, f.owner, text("live")).unwrap();

        let first: ServerEvent = serde_json::from_str(sub.recv().await.unwrap().as_str()).unwrap();
        assert_eq!(first, ServerEvent::NewMessage { message: saved });

        let second: ServerEvent = serde_json::from_str(sub.recv().await.unwrap().as_str()).unwrap();
        match second {
            ServerEvent::NotificationCreated { notification } => {
                assert_eq!(notification.user_id, f.member)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    async fn next_event(sub: &mut huddle_gateway::Subscription) -> serde_json::Value {
        let payload = sub.recv().await.unwrap();
        serde_json::from_str(payload.as_str()).unwrap()
    }

    #[tokio::test]
    async fn edit_broadcasts_updated_message() {
        let f = fixture();
        let id = f.pipeline.send(f.topic, f.owner, text("draft")).unwrap().message.id;
        let mut sub = f.pipeline.hub().register(f.topic, f.member);

        // Rejected edits broadcast nothing
        assert!(f.pipeline.edit(id, f.member, "hijack").is_err());
        let edited = f.pipeline.edit(id, f.owner, "final").unwrap();

        let event: ServerEvent = serde_json::from_value(next_event(&mut sub).await).unwrap();
        match event {
            ServerEvent::MessageUpdated { message } => {
                assert_eq!(message.message.content, "final");
                assert_eq!(message, edited);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_broadcasts_only_the_id() {
        let f = fixture();
        let mine = f.pipeline.send(f.topic, f.owner, text("gone soon")).unwrap().message.id;
        let mut sub = f.pipeline.hub().register(f.topic, f.member);

        assert!(f.pipeline.delete(mine, f.member).is_err());
        f.pipeline.delete(mine, f.owner).unwrap();

        assert_eq!(
            next_event(&mut sub).await,
            json!({ "type": "message_deleted", "payload": { "message_id": mine } })
        );
    }

    #[tokio::test]
    async fn toggle_broadcasts_current_groups() {
        let f = fixture();
        let id = f.pipeline.send(f.topic, f.owner, text("vote")).unwrap().message.id;
        let mut sub = f.pipeline.hub().register(f.topic, f.member);

        assert!(f.pipeline.toggle_reaction(id, f.outsider, "👍").is_err());
        let first = f.pipeline.toggle_reaction(id, f.owner, "👍").unwrap();
        let second = f.pipeline.toggle_reaction(id, f.member, "👍").unwrap();
        let cleared = {
            f.pipeline.toggle_reaction(id, f.owner, "👍").unwrap();
            f.pipeline.toggle_reaction(id, f.member, "👍").unwrap()
        };
        assert_eq!(second[0].count, 2);
        assert!(cleared.is_empty());

        for expected in [&first, &second] {
            let event: ServerEvent = serde_json::from_value(next_event(&mut sub).await).unwrap();
            assert_eq!(
                event,
                ServerEvent::ReactionUpdated {
                    message_id: id,
                    reactions: expected.clone(),
                }
            );
        }
        // Owner's removal, then the member's, which leaves no groups
        next_event(&mut sub).await;
        assert_eq!(
            next_event(&mut sub).await,
            json!({ "type": "reaction_updated", "payload": { "message_id": id, "reactions": [] } })
        );
    }

    #[tokio::test]
    async fn topic_access_requires_membership_and_existence() {
        let f = fixture();
        assert!(f.pipeline.can_read_topic(f.member, f.topic).unwrap());
        assert!(!f.pipeline.can_read_topic(f.outsider, f.topic).unwrap());
        assert!(!f.pipeline.can_read_topic(f.member, Uuid::new_v4()).unwrap());
    }
}
