//! In-process [`SceneStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::{SceneStore, StoreError};
use crate::memory::{MessageLog, ParticipantDirectory};
use crate::model::{
    ArcId, Campaign, CampaignId, CharacterState, LoreEntry, Message, MessageId, NewMessage,
    Participant, ParticipantId, Round, RoundId, RoundStatus, Scene, SceneId, StoryArc, World,
    WorldId,
};

#[derive(Debug, Default)]
struct Tables {
    worlds: BTreeMap<WorldId, World>,
    campaigns: BTreeMap<CampaignId, Campaign>,
    arcs: BTreeMap<ArcId, StoryArc>,
    scenes: BTreeMap<SceneId, Scene>,
    participants: BTreeMap<ParticipantId, Participant>,
    lore: Vec<LoreEntry>,
    states: BTreeMap<SceneId, BTreeMap<String, CharacterState>>,
    summaries: BTreeMap<SceneId, Vec<String>>,
    rounds: BTreeMap<RoundId, Round>,
    messages: BTreeMap<MessageId, Message>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn scene_mut(&mut self, id: SceneId) -> Result<&mut Scene, StoreError> {
        self.scenes
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("scene", id))
    }

    fn round_mut(&mut self, id: RoundId) -> Result<&mut Round, StoreError> {
        self.rounds
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("round", id))
    }

    fn scene_messages(&self, scene_id: SceneId) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .values()
            .filter(|m| m.scene_id == scene_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.number);
        messages
    }

    fn renumber(&mut self, scene_id: SceneId) {
        let ids: Vec<MessageId> = self.scene_messages(scene_id).iter().map(|m| m.id).collect();
        for (i, id) in ids.into_iter().enumerate() {
            if let Some(message) = self.messages.get_mut(&id) {
                message.number = i as u32 + 1;
            }
        }
    }
}

/// Every table in one mutex. Writes are serialized; rows are cloned out.
#[derive(Debug, Default)]
pub struct InMemorySceneStore {
    tables: Mutex<Tables>,
}

impl InMemorySceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    pub async fn insert_world(&self, world: World) {
        let mut t = self.tables.lock().await;
        t.last_id = t.last_id.max(world.id);
        t.worlds.insert(world.id, world);
    }

    pub async fn insert_campaign(&self, campaign: Campaign) {
        let mut t = self.tables.lock().await;
        t.last_id = t.last_id.max(campaign.id);
        t.campaigns.insert(campaign.id, campaign);
    }

    pub async fn insert_arc(&self, arc: StoryArc) {
        let mut t = self.tables.lock().await;
        t.last_id = t.last_id.max(arc.id);
        t.arcs.insert(arc.id, arc);
    }

    pub async fn insert_scene(&self, scene: Scene) {
        let mut t = self.tables.lock().await;
        t.last_id = t.last_id.max(scene.id);
        t.scenes.insert(scene.id, scene);
    }

    pub async fn insert_participant(&self, participant: Participant) {
        let mut t = self.tables.lock().await;
        t.last_id = t.last_id.max(participant.id);
        t.participants.insert(participant.id, participant);
    }

    pub async fn add_lore(&self, entry: LoreEntry) {
        self.tables.lock().await.lore.push(entry);
    }

    pub async fn add_summary(&self, scene_id: SceneId, summary: impl Into<String>) {
        self.tables
            .lock()
            .await
            .summaries
            .entry(scene_id)
            .or_default()
            .push(summary.into());
    }
}

#[async_trait]
impl SceneStore for InMemorySceneStore {
    async fn scene(&self, id: SceneId) -> Result<Option<Scene>, StoreError> {
        Ok(self.tables.lock().await.scenes.get(&id).cloned())
    }

    async fn story_arc(&self, id: ArcId) -> Result<Option<StoryArc>, StoreError> {
        Ok(self.tables.lock().await.arcs.get(&id).cloned())
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(self.tables.lock().await.campaigns.get(&id).cloned())
    }

    async fn world(&self, id: WorldId) -> Result<Option<World>, StoreError> {
        Ok(self.tables.lock().await.worlds.get(&id).cloned())
    }

    async fn lore(&self, world_id: WorldId) -> Result<Vec<LoreEntry>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .lore
            .iter()
            .filter(|l| l.world_id == world_id)
            .cloned()
            .collect())
    }

    async fn participant(&self, id: ParticipantId) -> Result<Option<Participant>, StoreError> {
        Ok(self.tables.lock().await.participants.get(&id).cloned())
    }

    async fn set_active_participants(
        &self,
        scene_id: SceneId,
        participants: Vec<ParticipantId>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        t.scene_mut(scene_id)?.active_participants = participants;
        Ok(())
    }

    async fn character_states(
        &self,
        scene_id: SceneId,
    ) -> Result<BTreeMap<String, CharacterState>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .states
            .get(&scene_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn merge_character_state(
        &self,
        scene_id: SceneId,
        name: &str,
        updates: CharacterState,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        t.scene_mut(scene_id)?;
        let state = t
            .states
            .entry(scene_id)
            .or_default()
            .entry(name.to_string())
            .or_default();
        state.extend(updates);
        Ok(())
    }

    async fn scene_summaries(&self, scene_id: SceneId) -> Result<Vec<String>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .summaries
            .get(&scene_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn round(&self, id: RoundId) -> Result<Option<Round>, StoreError> {
        Ok(self.tables.lock().await.rounds.get(&id).cloned())
    }

    async fn rounds(&self, scene_id: SceneId) -> Result<Vec<Round>, StoreError> {
        let t = self.tables.lock().await;
        let mut rounds: Vec<Round> = t
            .rounds
            .values()
            .filter(|r| r.scene_id == scene_id)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.number);
        Ok(rounds)
    }

    async fn begin_round(
        &self,
        scene_id: SceneId,
        active_participants: Vec<ParticipantId>,
    ) -> Result<Round, StoreError> {
        let mut t = self.tables.lock().await;
        t.scene_mut(scene_id)?;
        let number = t
            .rounds
            .values()
            .filter(|r| r.scene_id == scene_id)
            .map(|r| r.number)
            .max()
            .unwrap_or(0)
            + 1;
        let round = Round {
            id: t.next_id(),
            scene_id,
            number,
            active_participants,
            status: RoundStatus::InProgress,
            vectorized: false,
        };
        t.rounds.insert(round.id, round.clone());
        t.scene_mut(scene_id)?.current_round_id = Some(round.id);
        debug!(scene_id, round = number, "Began round");
        Ok(round)
    }

    async fn set_round_participants(
        &self,
        id: RoundId,
        participants: Vec<ParticipantId>,
    ) -> Result<(), StoreError> {
        self.tables.lock().await.round_mut(id)?.active_participants = participants;
        Ok(())
    }

    async fn complete_round(&self, id: RoundId) -> Result<(), StoreError> {
        self.tables.lock().await.round_mut(id)?.status = RoundStatus::Completed;
        Ok(())
    }

    async fn mark_vectorized(&self, id: RoundId) -> Result<(), StoreError> {
        self.tables.lock().await.round_mut(id)?.vectorized = true;
        Ok(())
    }

    async fn messages(&self, scene_id: SceneId) -> Result<Vec<Message>, StoreError> {
        Ok(self.tables.lock().await.scene_messages(scene_id))
    }

    async fn round_messages(&self, round_id: RoundId) -> Result<Vec<Message>, StoreError> {
        let t = self.tables.lock().await;
        let mut messages: Vec<Message> = t
            .messages
            .values()
            .filter(|m| m.round_id == round_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.number);
        Ok(messages)
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut t = self.tables.lock().await;
        let round = t
            .rounds
            .get(&message.round_id)
            .ok_or_else(|| StoreError::not_found("round", message.round_id))?;
        if round.scene_id != message.scene_id {
            return Err(StoreError::Conflict(format!(
                "round {} does not belong to scene {}",
                message.round_id, message.scene_id
            )));
        }
        let number = t
            .messages
            .values()
            .filter(|m| m.scene_id == message.scene_id)
            .count() as u32
            + 1;
        let stored = Message {
            id: t.next_id(),
            scene_id: message.scene_id,
            round_id: message.round_id,
            number,
            speaker: message.speaker,
            speaker_id: message.speaker_id,
            role: message.role,
            content: message.content,
            created_at: Utc::now(),
        };
        t.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn edit_message(&self, id: MessageId, content: String) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let message = t
            .messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("message", id))?;
        message.content = content;
        Ok(())
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let message = t
            .messages
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("message", id))?;
        t.renumber(message.scene_id);
        Ok(())
    }
}

#[async_trait]
impl ParticipantDirectory for InMemorySceneStore {
    async fn world_ids(&self) -> Result<Vec<WorldId>, StoreError> {
        Ok(self.tables.lock().await.worlds.keys().copied().collect())
    }

    async fn participants(&self) -> Result<Vec<Participant>, StoreError> {
        Ok(self.tables.lock().await.participants.values().cloned().collect())
    }
}

#[async_trait]
impl MessageLog for InMemorySceneStore {
    async fn messages_since(
        &self,
        scene_id: SceneId,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.scene_id == scene_id && m.created_at > since)
            .count() as u64)
    }
}
