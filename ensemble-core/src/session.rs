//! Session context: everything a round needs to know about its scene.
//!
//! A session context is resolved fresh at the start of each round by walking
//! Scene → Arc → Campaign → World. A scene whose chain is broken cannot be
//! played; resolution fails rather than guessing.

use crate::model::{
    Campaign, CharacterState, LoreEntry, Participant, ParticipantId, Scene, SceneId, StoryArc,
    World, WorldId,
};
use crate::store::{SceneStore, StoreError};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from resolving a session context.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scene {0} not found")]
    SceneNotFound(SceneId),

    #[error("Scene {scene_id} has no {missing}")]
    BrokenChain {
        scene_id: SceneId,
        missing: &'static str,
    },
}

/// Snapshot of a scene and its surroundings.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub world: World,
    pub campaign: Campaign,
    pub arc: StoryArc,
    pub scene: Scene,
    /// Active characters, in the scene's order.
    pub participants: Vec<Participant>,
    pub persona: Option<Participant>,
    pub lore: Vec<LoreEntry>,
    pub character_states: BTreeMap<String, CharacterState>,
    pub summaries: Vec<String>,
}

impl SessionContext {
    /// Load the context for `scene_id`.
    pub async fn resolve(store: &dyn SceneStore, scene_id: SceneId) -> Result<Self, SessionError> {
        let scene = store
            .scene(scene_id)
            .await?
            .ok_or(SessionError::SceneNotFound(scene_id))?;
        let broken = |missing: &'static str| SessionError::BrokenChain { scene_id, missing };

        let arc_id = scene.arc_id.ok_or_else(|| broken("story arc"))?;
        let arc = store.story_arc(arc_id).await?.ok_or_else(|| broken("story arc"))?;
        let campaign_id = arc.campaign_id.ok_or_else(|| broken("campaign"))?;
        let campaign = store
            .campaign(campaign_id)
            .await?
            .ok_or_else(|| broken("campaign"))?;
        let world_id = campaign.world_id.ok_or_else(|| broken("world"))?;
        let world = store.world(world_id).await?.ok_or_else(|| broken("world"))?;

        let mut participants = Vec::with_capacity(scene.active_participants.len());
        for &id in &scene.active_participants {
            match store.participant(id).await? {
                Some(p) => participants.push(p),
                None => warn!(scene_id, participant_id = id, "Active participant not found"),
            }
        }
        let persona = match scene.persona_id {
            Some(id) => store.participant(id).await?,
            None => None,
        };

        let lore = store.lore(world_id).await?;
        let character_states = store.character_states(scene_id).await?;
        let summaries = store.scene_summaries(scene_id).await?;

        debug!(
            scene_id,
            world_id,
            participants = participants.len(),
            lore = lore.len(),
            "Resolved session context"
        );

        Ok(Self {
            world,
            campaign,
            arc,
            scene,
            participants,
            persona,
            lore,
            character_states,
            summaries,
        })
    }

    pub fn world_id(&self) -> WorldId {
        self.world.id
    }

    pub fn scene_id(&self) -> SceneId {
        self.scene.id
    }

    /// Case-insensitive lookup among active participants.
    pub fn participant_by_name(&self, name: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_names(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.name.clone()).collect()
    }

    pub fn character_summaries(&self) -> Vec<String> {
        self.participants.iter().map(Participant::summary).collect()
    }

    pub fn scenario_notes(&self) -> Vec<String> {
        self.scene
            .scenario_notes
            .iter()
            .filter(|n| !n.trim().is_empty())
            .cloned()
            .collect()
    }

    pub fn lore_lines(&self) -> Vec<String> {
        self.lore.iter().map(LoreEntry::render).collect()
    }
}
