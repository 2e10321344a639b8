//! Long-term memory: scoped vector storage and ranked retrieval.

mod boost;
mod decay;
mod embedding;
mod index;
mod retriever;
mod scope;
mod store;

pub use boost::{apply_boosts, boost_factor, rule_matches};
pub use decay::{decay_factor, DecayInput};
pub use embedding::{cosine_similarity, l2_normalize, EmbeddingProvider, HashEmbedder};
pub use index::FlatIndex;
pub use retriever::{
    MemoryRetriever, MessageLog, ParticipantDirectory, RetrievalScope, RetrievedMemory,
};
pub use scope::MemoryScope;
pub use store::{DeleteOptions, DeleteReport, MemoryStore};

use crate::model::{ArcId, CampaignId, MessageId, ParticipantId, RoundId, SceneId, WorldId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// `type` tag on memories written by the vectorizer.
pub const ROUND_MEMORY: &str = "round_memory";

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Embedding provider is not ready")]
    NotReady,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not a memory scope: {0}")]
    InvalidScope(String),

    #[error("Vector dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Refusing to delete {matched} memories (threshold {threshold}) without confirm")]
    BulkDeleteRejected { matched: usize, threshold: usize },
}

/// Provenance stored alongside every memory.
///
/// Unknown keys survive a round trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_id: Option<RoundId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<SceneId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<ParticipantId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_id: Option<WorldId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actors: Vec<String>,
    /// RFC 3339. Kept as text so a malformed value is carried, not rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arc_id: Option<ArcId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub message_ids: Vec<MessageId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub speaker_ids: Vec<ParticipantId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub decay_exempt: bool,
    /// Precomputed message-count age; skips the message log lookup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_age: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemoryMetadata {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Whether every `filter` entry equals the value at that dot path.
    pub fn matches_filter(&self, filter: &Map<String, Value>) -> bool {
        let value = self.to_value();
        filter.iter().all(|(path, expected)| {
            lookup_path(&value, path).is_some_and(|actual| loosely_equal(actual, expected))
        })
    }
}

/// Walk a dot path (`extra.tags`, `actors`) through nested objects.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, key| current.as_object()?.get(key))
}

/// Equality that also accepts `"12"` for `12` and an array holding the value.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Array(items), _) => items.iter().any(|item| loosely_equal(item, expected)),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => false,
    }
}

/// One stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: String,
    pub text: String,
    pub metadata: MemoryMetadata,
    pub vector: Vec<f32>,
}

/// A nearest-neighbour match from one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    /// Cosine similarity to the query.
    pub score: f32,
    pub scope: MemoryScope,
    pub metadata: MemoryMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> MemoryMetadata {
        let mut extra = Map::new();
        extra.insert("mood".to_string(), json!({"tone": "tense"}));
        MemoryMetadata {
            scene_id: Some(12),
            character_name: Some("Alice".to_string()),
            actors: vec!["Alice".to_string(), "Bob".to_string()],
            kind: Some(ROUND_MEMORY.to_string()),
            extra,
            ..MemoryMetadata::default()
        }
    }

    #[test]
    fn test_serializes_schema_names() {
        let value = metadata().to_value();
        assert_eq!(value["sceneId"], json!(12));
        assert_eq!(value["type"], json!("round_memory"));
        assert_eq!(value["mood"]["tone"], json!("tense"));
        assert!(value.get("decayExempt").is_none());
    }

    #[test]
    fn test_unknown_keys_round_trip() {
        let parsed: MemoryMetadata =
            serde_json::from_value(json!({"sceneId": 3, "location": "docks"})).unwrap();
        assert_eq!(parsed.scene_id, Some(3));
        assert_eq!(parsed.extra["location"], json!("docks"));
    }

    #[test]
    fn test_filter_matching() {
        let meta = metadata();
        let filter = |v: Value| v.as_object().cloned().unwrap();

        assert!(meta.matches_filter(&filter(json!({"sceneId": 12}))));
        assert!(meta.matches_filter(&filter(json!({"sceneId": "12"}))));
        assert!(meta.matches_filter(&filter(json!({"actors": "Bob"}))));
        assert!(meta.matches_filter(&filter(json!({"mood.tone": "tense"}))));
        assert!(!meta.matches_filter(&filter(json!({"sceneId": 13}))));
        assert!(!meta.matches_filter(&filter(json!({"roundId": 1}))));
    }
}
