use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use huddle_types::api::{Claims, ToggleReactionRequest, ToggleReactionResponse};
use huddle_types::models::{ReactionEntry, ReactionGroup};

use crate::AppState;
use crate::error::{ApiResult, blocking};

/// Group raw reaction rows by emoji, as seen by `viewer`.
///
/// Groups come out in the order each emoji was first seen in `entries`.
pub fn aggregate(entries: &[ReactionEntry], viewer: Uuid) -> Vec<ReactionGroup> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<ReactionGroup> = Vec::new();

    for entry in entries {
        let slot = *index.entry(entry.emoji.as_str()).or_insert_with(|| {
            groups.push(ReactionGroup {
                emoji: entry.emoji.clone(),
                count: 0,
                users: vec![],
                has_self: false,
            });
            groups.len() - 1
        });

        let group = &mut groups[slot];
        if group.users.contains(&entry.user_id) {
            continue;
        }
        group.users.push(entry.user_id);
        group.count += 1;
        group.has_self |= entry.user_id == viewer;
    }

    groups
}

/// [`aggregate`] over rows for many messages at once.
pub fn aggregate_by_message(
    rows: &[(Uuid, ReactionEntry)],
    viewer: Uuid,
) -> HashMap<Uuid, Vec<ReactionGroup>> {
    let mut per_message: HashMap<Uuid, Vec<ReactionEntry>> = HashMap::new();
    for (message_id, entry) in rows {
        per_message.entry(*message_id).or_default().push(entry.clone());
    }
    per_message
        .into_iter()
        .map(|(message_id, entries)| (message_id, aggregate(&entries, viewer)))
        .collect()
}

pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state.pipeline.clone();
    let reactions =
        blocking(move || pipeline.toggle_reaction(message_id, claims.sub, &req.emoji)).await?;

    Ok(Json(ToggleReactionResponse {
        message_id,
        reactions,
    }))
}
