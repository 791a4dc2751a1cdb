use crate::Database;
use crate::models::{
    MESSAGE_COLUMNS, NOTIFICATION_COLUMNS, format_ts, message_from_row, notification_from_row,
    ts_at, uuid_at,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use huddle_types::models::{
    Message, MessageWithUser, NewNotification, Notification, ProjectRole, ReactionEntry, Topic,
};

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: Uuid,
        name: &str,
        email: &str,
        avatar_url: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, avatar_url) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), name, email, avatar_url],
            )?;
            Ok(())
        })
    }

    // -- Projects & membership --

    /// Create a project and make `owner_id` its owner.
    pub fn create_project(&self, id: Uuid, name: &str, owner_id: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO projects (id, name) VALUES (?1, ?2)",
                params![id.to_string(), name],
            )?;
            tx.execute(
                "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, 'owner')",
                params![id.to_string(), owner_id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Add a member, or change the role of an existing one.
    pub fn set_member_role(&self, project_id: Uuid, user_id: Uuid, role: ProjectRole) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_id, user_id) DO UPDATE SET role = excluded.role",
                params![project_id.to_string(), user_id.to_string(), role.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn remove_member(&self, project_id: Uuid, user_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id.to_string(), user_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn member_role(&self, project_id: Uuid, user_id: Uuid) -> Result<Option<ProjectRole>> {
        let role: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT role FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
        })?;

        Ok(role.map(|r| r.parse()).transpose()?)
    }

    pub fn is_member(&self, project_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(self.member_role(project_id, user_id)?.is_some())
    }

    pub fn member_ids(&self, project_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM project_members WHERE project_id = ?1 ORDER BY joined_at, user_id",
            )?;
            let ids = stmt
                .query_map([project_id.to_string()], |row| uuid_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Topics --

    pub fn create_topic(&self, id: Uuid, project_id: Uuid, name: &str) -> Result<()> {
        let now = format_ts(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO topics (id, project_id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                params![id.to_string(), project_id.to_string(), name, now],
            )?;
            Ok(())
        })
    }

    pub fn get_topic(&self, id: Uuid) -> Result<Option<Topic>> {
        self.with_conn(|conn| query_topic(conn, id))
    }

    /// Rename a topic and store the system message announcing it, atomically.
    pub fn rename_topic(&self, topic_id: Uuid, name: &str, announcement: &Message) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE topics SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![topic_id.to_string(), name, format_ts(announcement.created_at)],
            )?;
            insert_message(&tx, announcement)?;
            tx.commit()?;
            Ok(())
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| insert_message(conn, message))
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<MessageWithUser>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 LEFT JOIN users u ON u.id = m.user_id
                 WHERE m.id = ?1"
            );
            conn.query_row(&sql, [id.to_string()], message_from_row).optional()
        })
    }

    /// Newest first. `before` is an exclusive cursor on `created_at`.
    pub fn list_messages(
        &self,
        topic_id: Uuid,
        limit: u32,
        offset: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageWithUser>> {
        let before = before.map(format_ts);
        self.with_conn(|conn| {
            // JOIN users to fetch the author profile in a single query (no N+1)
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 LEFT JOIN users u ON u.id = m.user_id
                 WHERE m.topic_id = ?1 AND (?2 IS NULL OR m.created_at < ?2)
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?3 OFFSET ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![topic_id.to_string(), before, limit, offset],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Case-insensitive substring search over message content, newest first.
    /// Case folding is Unicode-aware, so matching happens on decoded rows
    /// instead of through `LIKE`.
    pub fn search_messages(
        &self,
        topic_id: Uuid,
        query: &str,
        limit: u32,
    ) -> Result<Vec<MessageWithUser>> {
        let needle = query.to_lowercase();
        let limit = limit as usize;
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 LEFT JOIN users u ON u.id = m.user_id
                 WHERE m.topic_id = ?1
                 ORDER BY m.created_at DESC, m.rowid DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut hits = Vec::new();
            for row in stmt.query_map([topic_id.to_string()], message_from_row)? {
                if hits.len() >= limit {
                    break;
                }
                let message = row?;
                if message.message.content.to_lowercase().contains(&needle) {
                    hits.push(message);
                }
            }
            Ok(hits)
        })
    }

    /// Returns false if the message no longer exists.
    pub fn update_message_content(
        &self,
        id: Uuid,
        content: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), content, format_ts(updated_at)],
            )?;
            Ok(changed > 0)
        })
    }

    /// Returns false if there was nothing to delete.
    pub fn delete_message(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
            Ok(changed > 0)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if it exists, inserts if not.
    /// Returns true when the reaction was added.
    pub fn toggle_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM message_reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id.to_string(), user_id.to_string(), emoji],
            )?;
            if removed > 0 {
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO message_reactions (id, message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(message_id, user_id, emoji) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    message_id.to_string(),
                    user_id.to_string(),
                    emoji,
                    format_ts(Utc::now())
                ],
            )?;
            Ok(true)
        })
    }

    pub fn get_reactions(&self, message_id: Uuid) -> Result<Vec<ReactionEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT emoji, user_id FROM message_reactions
                 WHERE message_id = ?1
                 ORDER BY created_at, rowid",
            )?;
            let rows = stmt
                .query_map([message_id.to_string()], |row| {
                    Ok(ReactionEntry {
                        emoji: row.get(0)?,
                        user_id: uuid_at(row, 1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch reactions for a set of message ids, keyed by message id.
    pub fn get_reactions_for_messages(
        &self,
        message_ids: &[Uuid],
    ) -> Result<Vec<(Uuid, ReactionEntry)>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, emoji, user_id FROM message_reactions
                 WHERE message_id IN ({})
                 ORDER BY created_at, rowid",
                placeholders.join(", ")
            );

            let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                    Ok((
                        uuid_at(row, 0)?,
                        ReactionEntry {
                            emoji: row.get(1)?,
                            user_id: uuid_at(row, 2)?,
                        },
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Pins --

    /// Returns false if the pair was already pinned.
    pub fn pin_message(&self, topic_id: Uuid, message_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO pinned_messages (topic_id, message_id, pinned_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT DO NOTHING",
                params![topic_id.to_string(), message_id.to_string(), format_ts(Utc::now())],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Returns false if the pair was not pinned.
    pub fn unpin_message(&self, topic_id: Uuid, message_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM pinned_messages WHERE topic_id = ?1 AND message_id = ?2",
                params![topic_id.to_string(), message_id.to_string()],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn list_pinned(&self, topic_id: Uuid) -> Result<Vec<MessageWithUser>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM pinned_messages p
                 JOIN messages m ON m.id = p.message_id
                 LEFT JOIN users u ON u.id = m.user_id
                 WHERE p.topic_id = ?1
                 ORDER BY m.created_at DESC, m.rowid DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([topic_id.to_string()], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn pinned_count(&self, topic_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pinned_messages WHERE topic_id = ?1",
                [topic_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    // -- Notifications --

    /// Store one notification. Returns `None` when an identical mention for
    /// the same message already exists.
    pub fn insert_notification(&self, new: &NewNotification) -> Result<Option<Notification>> {
        let id = Uuid::new_v4();
        let now = format_ts(Utc::now());
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO notifications (id, user_id, title, body, link, type, message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT DO NOTHING",
                params![
                    id.to_string(),
                    new.user_id.to_string(),
                    new.title,
                    new.body,
                    new.link,
                    new.kind.as_str(),
                    new.message_id.map(|m| m.to_string()),
                    now
                ],
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            query_notification(conn, id)
        })
    }

    pub fn list_notifications(
        &self,
        user_id: Uuid,
        limit: u32,
        unread_only: bool,
    ) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE user_id = ?1 AND (?2 = 0 OR is_read = 0)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![user_id.to_string(), unread_only, limit],
                    notification_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Unread → read. Already-read notifications keep their original `read_at`.
    /// Returns `None` if the notification does not exist or belongs to someone else.
    pub fn mark_notification_read(&self, id: Uuid, user_id: Uuid) -> Result<Option<Notification>> {
        let now = format_ts(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE notifications SET is_read = 1, read_at = ?3
                 WHERE id = ?1 AND user_id = ?2 AND is_read = 0",
                params![id.to_string(), user_id.to_string(), now],
            )?;
            let found = query_notification(conn, id)?;
            Ok(found.filter(|n| n.user_id == user_id))
        })
    }
}

fn insert_message(conn: &Connection, message: &Message) -> Result<()> {
    let metadata = message
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO messages (id, topic_id, user_id, content, type, metadata, parent_id, reply_to_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            message.id.to_string(),
            message.topic_id.to_string(),
            message.user_id.map(|u| u.to_string()),
            message.content,
            message.kind.as_str(),
            metadata,
            message.parent_id.map(|p| p.to_string()),
            message.reply_to_id.map(|r| r.to_string()),
            format_ts(message.created_at),
            format_ts(message.updated_at),
        ],
    )?;
    Ok(())
}

fn query_topic(conn: &Connection, id: Uuid) -> Result<Option<Topic>> {
    conn.query_row(
        "SELECT id, project_id, name, created_at, updated_at FROM topics WHERE id = ?1",
        [id.to_string()],
        |row| {
            Ok(Topic {
                id: uuid_at(row, 0)?,
                project_id: uuid_at(row, 1)?,
                name: row.get(2)?,
                created_at: ts_at(row, 3)?,
                updated_at: ts_at(row, 4)?,
            })
        },
    )
    .optional()
}

fn query_notification(conn: &Connection, id: Uuid) -> Result<Option<Notification>> {
    let sql = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], notification_from_row)
        .optional()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
