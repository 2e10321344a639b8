//! Rows read from and written to the scene store.
//!
//! These mirror the relational schema the engine consumes. The engine never
//! owns them; it reads snapshots and writes through [`crate::store::SceneStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type WorldId = i64;
pub type CampaignId = i64;
pub type ArcId = i64;
pub type SceneId = i64;
pub type RoundId = i64;
pub type MessageId = i64;
pub type ParticipantId = i64;

/// Free-form state fields for one participant (mood, location, outfit, ...).
pub type CharacterState = BTreeMap<String, Value>;

/// A setting that campaigns take place in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct World {
    pub id: WorldId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: CampaignId,
    pub world_id: Option<WorldId>,
    pub name: String,
}

/// A story arc inside a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryArc {
    pub id: ArcId,
    pub campaign_id: Option<CampaignId>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: SceneId,
    pub arc_id: Option<ArcId>,
    pub name: String,
    /// Free-text notes the author keeps about the scenario.
    #[serde(default)]
    pub scenario_notes: Option<String>,
    /// Characters currently taking part in the scene.
    #[serde(default)]
    pub active_participants: Vec<ParticipantId>,
    /// The user's stand-in, if any.
    #[serde(default)]
    pub persona_id: Option<ParticipantId>,
    /// Pointer to the round in progress (or the last completed one).
    #[serde(default)]
    pub current_round_id: Option<RoundId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: RoundId,
    pub scene_id: SceneId,
    /// Monotonic within the scene, starting at 1.
    pub number: u32,
    pub active_participants: Vec<ParticipantId>,
    pub status: RoundStatus,
    pub vectorized: bool,
}

impl Round {
    pub fn is_completed(&self) -> bool {
        self.status == RoundStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Character,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub scene_id: SceneId,
    pub round_id: RoundId,
    /// Scene-scoped sequence number, gap-free.
    pub number: u32,
    pub speaker: String,
    pub speaker_id: Option<ParticipantId>,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// `"Speaker: content"`, the form used in history and transcripts.
    pub fn attributed(&self) -> String {
        format!("{}: {}", self.speaker, self.content)
    }
}

/// A message about to be appended; the store assigns id, number and time.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub scene_id: SceneId,
    pub round_id: RoundId,
    pub speaker: String,
    pub speaker_id: Option<ParticipantId>,
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Character,
    Persona,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub kind: ParticipantKind,
    #[serde(default)]
    pub description: String,
}

impl Participant {
    pub fn character(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ParticipantKind::Character,
            description: String::new(),
        }
    }

    pub fn persona(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            kind: ParticipantKind::Persona,
            ..Self::character(id, name)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// One-line summary used in context envelopes.
    pub fn summary(&self) -> String {
        if self.description.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.description)
        }
    }
}

/// A lore entry attached to a world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoreEntry {
    pub world_id: WorldId,
    pub title: String,
    pub content: String,
}

impl LoreEntry {
    pub fn render(&self) -> String {
        format!("{}: {}", self.title, self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_status_serializes_kebab_case() {
        let json = serde_json::to_string(&RoundStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn test_participant_summary() {
        let plain = Participant::character(1, "Alice");
        assert_eq!(plain.summary(), "Alice");

        let described = Participant::character(2, "Bob").with_description("a wary smuggler");
        assert_eq!(described.summary(), "Bob: a wary smuggler");
        assert_eq!(Participant::persona(3, "Nia").kind, ParticipantKind::Persona);
    }
}
