//! The relational store the engine reads from and writes through.
//!
//! The engine never owns scene data. [`SceneStore`] is the seam to whatever
//! database backs the application; [`InMemorySceneStore`] is a complete
//! implementation for tests and single-process use.

mod memory;

pub use memory::InMemorySceneStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    ArcId, Campaign, CampaignId, CharacterState, LoreEntry, Message, MessageId, NewMessage,
    Participant, ParticipantId, Round, RoundId, Scene, SceneId, StoryArc, World, WorldId,
};
use std::collections::BTreeMap;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        StoreError::NotFound { kind, id }
    }
}

/// Row-level access to scenes, rounds, messages and state.
///
/// Implementations serialize their own writes; the engine may call into one
/// store from several rounds at once.
#[async_trait]
pub trait SceneStore: Send + Sync {
    // Hierarchy
    async fn scene(&self, id: SceneId) -> Result<Option<Scene>, StoreError>;
    async fn story_arc(&self, id: ArcId) -> Result<Option<StoryArc>, StoreError>;
    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;
    async fn world(&self, id: WorldId) -> Result<Option<World>, StoreError>;
    async fn lore(&self, world_id: WorldId) -> Result<Vec<LoreEntry>, StoreError>;

    // Participants and state
    async fn participant(&self, id: ParticipantId) -> Result<Option<Participant>, StoreError>;
    async fn set_active_participants(
        &self,
        scene_id: SceneId,
        participants: Vec<ParticipantId>,
    ) -> Result<(), StoreError>;
    /// State keyed by participant name.
    async fn character_states(
        &self,
        scene_id: SceneId,
    ) -> Result<BTreeMap<String, CharacterState>, StoreError>;
    /// Merge `updates` into the named participant's state, field by field.
    async fn merge_character_state(
        &self,
        scene_id: SceneId,
        name: &str,
        updates: CharacterState,
    ) -> Result<(), StoreError>;
    async fn scene_summaries(&self, scene_id: SceneId) -> Result<Vec<String>, StoreError>;

    // Rounds
    async fn round(&self, id: RoundId) -> Result<Option<Round>, StoreError>;
    /// All rounds of a scene in round-number order.
    async fn rounds(&self, scene_id: SceneId) -> Result<Vec<Round>, StoreError>;
    /// Open the next round and point the scene at it.
    async fn begin_round(
        &self,
        scene_id: SceneId,
        active_participants: Vec<ParticipantId>,
    ) -> Result<Round, StoreError>;
    /// Replace an open round's participant set after an activation change.
    async fn set_round_participants(
        &self,
        id: RoundId,
        participants: Vec<ParticipantId>,
    ) -> Result<(), StoreError>;
    async fn complete_round(&self, id: RoundId) -> Result<(), StoreError>;
    async fn mark_vectorized(&self, id: RoundId) -> Result<(), StoreError>;

    // Messages
    /// Scene messages in sequence order.
    async fn messages(&self, scene_id: SceneId) -> Result<Vec<Message>, StoreError>;
    async fn round_messages(&self, round_id: RoundId) -> Result<Vec<Message>, StoreError>;
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError>;
    async fn edit_message(&self, id: MessageId, content: String) -> Result<(), StoreError>;
    /// Delete a message and renumber the rest of its scene without gaps.
    async fn delete_message(&self, id: MessageId) -> Result<(), StoreError>;
}
