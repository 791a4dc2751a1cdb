use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// The part of a message's metadata that names mentioned users.
#[derive(Debug, Default, Deserialize)]
pub struct MentionPayload {
    #[serde(default)]
    pub mentions: Vec<MentionRef>,
}

#[derive(Debug, Deserialize)]
pub struct MentionRef {
    pub id: Uuid,
}

impl MentionPayload {
    /// Decode leniently. Missing or malformed metadata means no mentions.
    ///
    /// Clients sometimes send the metadata object JSON-encoded as a string,
    /// so a string value is decoded once more.
    pub fn from_metadata(metadata: Option<&Value>) -> Self {
        let decoded = match metadata {
            None | Some(Value::Null) => return Self::default(),
            Some(Value::String(raw)) => serde_json::from_str::<Self>(raw),
            Some(value) => Self::deserialize(value),
        };
        decoded.unwrap_or_default()
    }

    /// Mentioned ids in first-seen order, duplicates removed.
    pub fn user_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = Vec::with_capacity(self.mentions.len());
        for mention in &self.mentions {
            if !ids.contains(&mention.id) {
                ids.push(mention.id);
            }
        }
        ids
    }
}
