//! Row mapping between SQLite columns and the shared model types.
//!
//! Ids and timestamps are stored as TEXT. Timestamps use a fixed-width
//! RFC 3339 form so that lexical order matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use huddle_types::models::{Message, MessageWithUser, Notification, UserProfile};

/// Column list matching [`message_from_row`].
pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.topic_id, m.user_id, m.content, m.type, m.metadata, \
     m.parent_id, m.reply_to_id, m.created_at, m.updated_at, \
     u.id, u.name, u.email, u.avatar_url";

/// Column list matching [`notification_from_row`].
pub(crate) const NOTIFICATION_COLUMNS: &str =
    "id, user_id, title, body, link, type, message_id, is_read, read_at, created_at";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

/// Map a row selected with [`MESSAGE_COLUMNS`]. Reactions are left empty;
/// they depend on who is asking.
pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageWithUser> {
    let kind: String = row.get(4)?;
    let metadata: Option<String> = row.get(5)?;

    let message = Message {
        id: uuid_at(row, 0)?,
        topic_id: uuid_at(row, 1)?,
        user_id: opt_uuid_at(row, 2)?,
        content: row.get(3)?,
        kind: kind.parse().map_err(|e| conversion_error(4, e))?,
        metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
        parent_id: opt_uuid_at(row, 6)?,
        reply_to_id: opt_uuid_at(row, 7)?,
        created_at: ts_at(row, 8)?,
        updated_at: ts_at(row, 9)?,
    };

    // LEFT JOIN: system messages and deleted authors have no profile
    let user = match opt_uuid_at(row, 10)? {
        Some(id) => Some(UserProfile {
            id,
            name: row.get(11)?,
            email: row.get(12)?,
            avatar_url: row.get(13)?,
        }),
        None => None,
    };

    Ok(MessageWithUser {
        message,
        user,
        reactions: vec![],
    })
}

pub(crate) fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let kind: String = row.get(5)?;
    Ok(Notification {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        link: row.get(4)?,
        kind: kind.parse().map_err(|e| conversion_error(5, e))?,
        message_id: opt_uuid_at(row, 6)?,
        is_read: row.get(7)?,
        read_at: opt_ts_at(row, 8)?,
        created_at: ts_at(row, 9)?,
    })
}
