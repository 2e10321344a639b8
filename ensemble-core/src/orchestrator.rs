//! The round state machine.
//!
//! One call to [`Orchestrator::run_round`] plays one round of a scene:
//!
//! ```text
//! idle → director → world → character × N → reconciliation? → vectorization → completed
//! ```
//!
//! Steps run strictly in sequence. The Director decides who acts and may
//! change state; the World step refreshes tracked state; each Character then
//! speaks, and every line is persisted before the next Character's context
//! is built so later speakers see earlier ones. Vectorization is spawned and
//! never holds up or fails the round.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentKind, AgentOutput, CompletionProvider};
use crate::config::{ConfigSource, EngineConfig};
use crate::context::{ContextBuilder, ContextEnvelope, ContextSources, MemoryGroup};
use crate::director::{parse_state_updates, DirectorPlan};
use crate::memory::{
    MemoryRetriever, MemoryStore, MessageLog, ParticipantDirectory, RetrievalScope,
    RetrievedMemory,
};
use crate::model::{
    CharacterState, Message, MessageId, MessageRole, NewMessage, Participant, ParticipantId,
    ParticipantKind, Round, RoundStatus, SceneId,
};
use crate::normalize::unwrap_prompt;
use crate::session::{SessionContext, SessionError};
use crate::store::{SceneStore, StoreError};
use crate::vectorize::VectorizationAgent;

/// Memory group holding the lines already spoken this round.
pub const THIS_ROUND: &str = "This round";

const DIRECTOR_TASK: &str =
    "Plan this round: choose who acts and in what order, and record any state changes.";
const WORLD_TASK: &str = "Report how each character's tracked state has changed.";
const RECONCILIATION_TASK: &str =
    "Review the round's responses and record the state changes they made true.";

fn character_task(name: &str) -> String {
    format!("Write what {name} says and does next.")
}

#[derive(Debug, Error)]
pub enum RoundError {
    #[error("Scene {0} not found")]
    SceneNotFound(SceneId),

    #[error("Scene {scene_id} has no {missing}")]
    BrokenChain {
        scene_id: SceneId,
        missing: &'static str,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<SessionError> for RoundError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Store(e) => RoundError::Store(e),
            SessionError::SceneNotFound(id) => RoundError::SceneNotFound(id),
            SessionError::BrokenChain { scene_id, missing } => {
                RoundError::BrokenChain { scene_id, missing }
            }
        }
    }
}

/// States a round passes through, recorded in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Idle,
    DirectorPass,
    WorldPass,
    CharacterPass(ParticipantId),
    ReconciliationPass,
    Vectorization,
    Completed,
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct EngineHandles {
    pub store: Arc<dyn SceneStore>,
    pub directory: Arc<dyn ParticipantDirectory>,
    pub config: Arc<dyn ConfigSource>,
    pub memory: Arc<MemoryStore>,
    pub retriever: Arc<MemoryRetriever>,
    pub provider: Arc<dyn CompletionProvider>,
}

impl EngineHandles {
    pub fn new(
        store: Arc<dyn SceneStore>,
        directory: Arc<dyn ParticipantDirectory>,
        config: Arc<dyn ConfigSource>,
        memory: Arc<MemoryStore>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        let retriever = Arc::new(MemoryRetriever::new(
            memory.clone(),
            config.clone(),
            directory.clone(),
        ));
        Self {
            store,
            directory,
            config,
            memory,
            retriever,
            provider,
        }
    }

    /// Rebuild the retriever with message-count decay lookups.
    pub fn with_message_log(mut self, messages: Arc<dyn MessageLog>) -> Self {
        self.retriever = Arc::new(
            MemoryRetriever::new(
                self.memory.clone(),
                self.config.clone(),
                self.directory.clone(),
            )
            .with_message_log(messages),
        );
        self
    }
}

/// What starts a round.
#[derive(Debug, Clone)]
pub struct RoundInput {
    pub scene_id: SceneId,
    pub speaker: String,
    pub speaker_id: Option<ParticipantId>,
    pub role: MessageRole,
    /// Raw content; nested or JSON-encoded prompts are unwrapped.
    pub content: Value,
}

impl RoundInput {
    pub fn user(scene_id: SceneId, speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            scene_id,
            speaker: speaker.into(),
            speaker_id: None,
            role: MessageRole::User,
            content: Value::String(content.into()),
        }
    }

    /// Input as it arrived from a client, possibly wrapped in JSON.
    pub fn raw(scene_id: SceneId, speaker: impl Into<String>, content: Value) -> Self {
        Self {
            content,
            ..Self::user(scene_id, speaker, String::new())
        }
    }

    pub fn system(scene_id: SceneId, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            ..Self::user(scene_id, "System", content)
        }
    }

    pub fn with_speaker_id(mut self, id: ParticipantId) -> Self {
        self.speaker_id = Some(id);
        self
    }
}

/// One character's contribution to a round.
#[derive(Debug, Clone)]
pub struct CharacterResponse {
    pub participant: Participant,
    pub message: Message,
    /// The model call failed and the line is canned.
    pub fallback: bool,
}

/// Result of a round.
#[derive(Debug)]
pub struct RoundOutcome {
    pub round: Round,
    pub phases: Vec<RoundPhase>,
    pub plan: DirectorPlan,
    pub reconciliation: Option<DirectorPlan>,
    pub responses: Vec<CharacterResponse>,
    /// The spawned vectorization task, when vectorization is enabled.
    pub vectorization: Option<JoinHandle<()>>,
}

impl RoundOutcome {
    /// Character lines as `"Name: text"`, in speaking order.
    pub fn lines(&self) -> Vec<String> {
        self.responses.iter().map(|r| r.message.attributed()).collect()
    }

    pub fn passed(&self, phase: RoundPhase) -> bool {
        self.phases.contains(&phase)
    }
}

pub struct Orchestrator {
    handles: EngineHandles,
    vectorizer: Arc<VectorizationAgent>,
}

impl Orchestrator {
    pub fn new(handles: EngineHandles) -> Self {
        let vectorizer = Arc::new(VectorizationAgent::new(
            handles.store.clone(),
            handles.memory.clone(),
            handles.config.clone(),
        ));
        Self {
            handles,
            vectorizer,
        }
    }

    pub fn handles(&self) -> &EngineHandles {
        &self.handles
    }

    pub fn vectorizer(&self) -> &Arc<VectorizationAgent> {
        &self.vectorizer
    }

    /// Play one round of `input.scene_id`.
    pub async fn run_round(&self, input: RoundInput) -> Result<RoundOutcome, RoundError> {
        let config = self.handles.config.snapshot().await;
        let store = self.handles.store.as_ref();
        let scene_id = input.scene_id;
        let mut phases = vec![RoundPhase::Idle];

        let mut session = SessionContext::resolve(store, scene_id).await?;
        let mut round = self.current_round(&session).await?;

        let prompt = unwrap_prompt(input.content);
        if !prompt.trim().is_empty() {
            store
                .append_message(NewMessage {
                    scene_id,
                    round_id: round.id,
                    speaker: input.speaker.clone(),
                    speaker_id: input.speaker_id,
                    role: input.role,
                    content: prompt.clone(),
                })
                .await?;
        }
        info!(scene_id, round = round.number, "Round started");

        let builder = ContextBuilder::new(config.token_budget.clone());

        // ====================================================================
        // Director
        // ====================================================================

        phases.push(RoundPhase::DirectorPass);
        let director = Agent::new(AgentKind::Director, self.handles.provider.clone());
        let world_memories = self
            .handles
            .retriever
            .retrieve(
                &prompt,
                &RetrievalScope::world(session.world_id()).with_shared(),
                config.orchestration.memory_top_k,
            )
            .await;
        let sources = ContextSources {
            memories: group_by_label(world_memories),
            ..self.sources(&session, &config, &[]).await?
        };
        let output = director.run(&builder.build(sources), DIRECTOR_TASK, &config).await;
        let plan = plan_from(&output);
        debug!(
            actors = ?plan.actors.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            fallback = output.fallback,
            "Director planned round"
        );

        if self.apply_activation(&session, &plan).await? {
            session = SessionContext::resolve(store, scene_id).await?;
            round.active_participants = session.scene.active_participants.clone();
            store
                .set_round_participants(round.id, round.active_participants.clone())
                .await?;
        }
        self.merge_states(&mut session, &plan.state_updates).await?;

        // ====================================================================
        // World
        // ====================================================================

        if config.orchestration.world_pass {
            phases.push(RoundPhase::WorldPass);
            let world = Agent::new(AgentKind::World, self.handles.provider.clone());
            let sources = ContextSources {
                director_guidance: plan.guidance.clone(),
                ..self.sources(&session, &config, &[]).await?
            };
            let output = world.run(&builder.build(sources), WORLD_TASK, &config).await;
            let updates = parse_state_updates(output.json().and_then(|v| v.get("stateUpdates")));
            self.merge_states(&mut session, &updates).await?;
        }

        // ====================================================================
        // Characters
        // ====================================================================

        let mut this_round: Vec<String> = Vec::new();
        let mut responses = Vec::new();
        for participant in plan.acting_order(&session.participants) {
            phases.push(RoundPhase::CharacterPass(participant.id));
            let kind = AgentKind::character(participant.id, participant.name.clone());
            let agent = Agent::new(kind, self.handles.provider.clone());

            let query = if prompt.trim().is_empty() {
                this_round.last().cloned().unwrap_or_default()
            } else {
                prompt.clone()
            };
            let recalled = self
                .handles
                .retriever
                .retrieve(
                    &query,
                    &RetrievalScope::participant(session.world_id(), participant.id),
                    config.orchestration.memory_top_k,
                )
                .await;

            let mut memories = Vec::new();
            if !this_round.is_empty() {
                memories.push(MemoryGroup::new(THIS_ROUND, this_round.clone()));
            }
            memories.extend(group_by_label(recalled));

            let sources = ContextSources {
                memories,
                director_guidance: plan.guidance.clone(),
                character_guidance: plan
                    .actor(&participant.name)
                    .and_then(|a| a.guidance.clone()),
                ..self.sources(&session, &config, &spoken(&responses)).await?
            };
            let output = agent
                .run(&builder.build(sources), &character_task(&participant.name), &config)
                .await;
            let text = output.text().unwrap_or_default().to_string();

            let message = store
                .append_message(NewMessage {
                    scene_id,
                    round_id: round.id,
                    speaker: participant.name.clone(),
                    speaker_id: Some(participant.id),
                    role: MessageRole::Character,
                    content: text,
                })
                .await?;
            this_round.push(message.attributed());
            responses.push(CharacterResponse {
                participant,
                message,
                fallback: output.fallback,
            });
        }

        // ====================================================================
        // Reconciliation
        // ====================================================================

        let mut reconciliation = None;
        if config.orchestration.reconciliation {
            phases.push(RoundPhase::ReconciliationPass);
            let sources = ContextSources {
                director_guidance: plan.guidance.clone(),
                ..self.sources(&session, &config, &spoken(&responses)).await?
            };
            let envelope: ContextEnvelope = builder
                .build(sources)
                .without_director_guidance()
                .with_director_pass(2)
                .with_round_responses(this_round.clone());
            let output = director.run(&envelope, RECONCILIATION_TASK, &config).await;
            let second = plan_from(&output);
            self.merge_states(&mut session, &second.state_updates).await?;
            reconciliation = Some(second);
        }

        // ====================================================================
        // Completion
        // ====================================================================

        store.complete_round(round.id).await?;
        let round = Round {
            status: RoundStatus::Completed,
            ..round
        };

        let vectorization = if config.vectorization.enabled {
            phases.push(RoundPhase::Vectorization);
            Some(self.vectorizer.spawn_round(round.id))
        } else {
            None
        };
        phases.push(RoundPhase::Completed);

        info!(
            scene_id,
            round = round.number,
            responses = responses.len(),
            "Round completed"
        );
        Ok(RoundOutcome {
            round,
            phases,
            plan,
            reconciliation,
            responses,
            vectorization,
        })
    }

    /// The scene's current round if still open, else a new one.
    async fn current_round(&self, session: &SessionContext) -> Result<Round, RoundError> {
        let store = self.handles.store.as_ref();
        if let Some(id) = session.scene.current_round_id {
            if let Some(round) = store.round(id).await? {
                if !round.is_completed() {
                    return Ok(round);
                }
            }
        }
        let round = store
            .begin_round(session.scene_id(), session.scene.active_participants.clone())
            .await?;
        Ok(round)
    }

    /// Shared context for every step: history, summaries, lore, notes, cast
    /// and state. Messages in `skip` are left out of history; they reach the
    /// agent as this round's lines instead.
    async fn sources(
        &self,
        session: &SessionContext,
        config: &EngineConfig,
        skip: &[MessageId],
    ) -> Result<ContextSources, StoreError> {
        let history = self
            .handles
            .store
            .messages(session.scene_id())
            .await?
            .iter()
            .rev()
            .filter(|m| !skip.contains(&m.id))
            .take(config.orchestration.history_limit)
            .map(Message::attributed)
            .collect();

        Ok(ContextSources {
            history,
            summaries: session.summaries.clone(),
            lore: session.lore_lines(),
            scenario_notes: session.scenario_notes(),
            character_summaries: session.character_summaries(),
            persona_summary: session.persona.as_ref().map(Participant::summary),
            state_snapshots: session.character_states.clone(),
            ..ContextSources::default()
        })
    }

    /// Apply the plan's activation changes. Returns whether the active set
    /// changed.
    async fn apply_activation(
        &self,
        session: &SessionContext,
        plan: &DirectorPlan,
    ) -> Result<bool, RoundError> {
        if plan.activate.is_empty() && plan.deactivate.is_empty() {
            return Ok(false);
        }

        let mut active = session.scene.active_participants.clone();
        for name in &plan.deactivate {
            match session.participant_by_name(name) {
                Some(p) => active.retain(|id| *id != p.id),
                None => warn!(name = %name, "Cannot deactivate unknown participant"),
            }
        }

        if !plan.activate.is_empty() {
            let everyone = self.handles.directory.participants().await?;
            for name in &plan.activate {
                let found = everyone.iter().find(|p| {
                    p.kind == ParticipantKind::Character && p.name.eq_ignore_ascii_case(name.trim())
                });
                match found {
                    Some(p) if !active.contains(&p.id) => active.push(p.id),
                    Some(_) => {}
                    None => warn!(name = %name, "Cannot activate unknown participant"),
                }
            }
        }

        if active == session.scene.active_participants {
            return Ok(false);
        }
        info!(scene_id = session.scene_id(), active = ?active, "Active participants changed");
        self.handles
            .store
            .set_active_participants(session.scene_id(), active)
            .await?;
        Ok(true)
    }

    async fn merge_states(
        &self,
        session: &mut SessionContext,
        updates: &BTreeMap<String, CharacterState>,
    ) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let store = self.handles.store.as_ref();
        for (name, fields) in updates {
            store
                .merge_character_state(session.scene_id(), name, fields.clone())
                .await?;
        }
        session.character_states = store.character_states(session.scene_id()).await?;
        debug!(characters = updates.len(), "Merged state updates");
        Ok(())
    }
}

fn spoken(responses: &[CharacterResponse]) -> Vec<MessageId> {
    responses.iter().map(|r| r.message.id).collect()
}

fn plan_from(output: &AgentOutput) -> DirectorPlan {
    match output.json() {
        Some(value) if !output.validation_failed() => DirectorPlan::from_value(value),
        _ => DirectorPlan::default(),
    }
}

/// Group retrieved memories by participant label, keeping rank order.
fn group_by_label(memories: Vec<RetrievedMemory>) -> Vec<MemoryGroup> {
    let mut groups: Vec<MemoryGroup> = Vec::new();
    for memory in memories {
        match groups.iter_mut().find(|g| g.key == memory.participant_label) {
            Some(group) => group.entries.push(memory.text),
            None => groups.push(MemoryGroup::new(memory.participant_label, vec![memory.text])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestrationConfig;
    use crate::testing::{assert_order, ScriptedProvider, TestScene};

    fn quiet() -> EngineConfig {
        EngineConfig::default().with_orchestration(OrchestrationConfig {
            world_pass: false,
            ..OrchestrationConfig::default()
        })
    }

    #[tokio::test]
    async fn test_plan_order_and_phases() {
        let scene = TestScene::new().await;
        let provider = Arc::new(
            ScriptedProvider::new()
                .reply_for(
                    &AgentKind::Director,
                    r#"{"actors": [{"name": "Bob", "order": 1}, {"name": "Alice", "order": 2}]}"#,
                )
                .with_default("..."),
        );
        let orchestrator = Orchestrator::new(scene.handles(provider, quiet()));
        let outcome = orchestrator
            .run_round(RoundInput::user(scene.scene_id, "Nia", "Who goes first?"))
            .await
            .unwrap();

        assert_order(&outcome, &["Bob", "Alice"]);
        assert_eq!(
            outcome.phases,
            vec![
                RoundPhase::Idle,
                RoundPhase::DirectorPass,
                RoundPhase::CharacterPass(scene.bob),
                RoundPhase::CharacterPass(scene.alice),
                RoundPhase::Vectorization,
                RoundPhase::Completed,
            ]
        );
        assert!(outcome.round.is_completed());
    }

    #[tokio::test]
    async fn test_failed_director_falls_back_to_name_order() {
        let scene = TestScene::new().await;
        let provider = Arc::new(
            ScriptedProvider::new()
                .fail_for(&AgentKind::Director, "timeout")
                .with_default("..."),
        );
        let orchestrator = Orchestrator::new(scene.handles(provider, quiet()));
        let outcome = orchestrator
            .run_round(RoundInput::user(scene.scene_id, "Nia", "Hello?"))
            .await
            .unwrap();
        assert_order(&outcome, &["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_state_updates_reach_characters() {
        let scene = TestScene::new().await;
        let provider = Arc::new(
            ScriptedProvider::new()
                .reply_for(
                    &AgentKind::Director,
                    r#"{"actors": ["Alice"], "stateUpdates": {"Alice": {"mood": "tense", "outfit": "default"}}}"#,
                )
                .with_default("..."),
        );
        let orchestrator = Orchestrator::new(scene.handles(provider.clone(), quiet()));
        orchestrator
            .run_round(RoundInput::user(scene.scene_id, "Nia", "Look out!"))
            .await
            .unwrap();

        let states = scene.store.character_states(scene.scene_id).await.unwrap();
        assert_eq!(states["Alice"].get("mood"), Some(&serde_json::json!("tense")));
        assert!(!states["Alice"].contains_key("outfit"));

        let alice = &provider.requests_for(&AgentKind::character(scene.alice, "Alice"))[0];
        assert!(alice.messages[0].content.contains("- Alice: mood: tense"));
    }

    #[tokio::test]
    async fn test_activation_brings_in_new_character() {
        let scene = TestScene::new().await;
        scene.add_character(13, "Cyra").await;
        let provider = Arc::new(
            ScriptedProvider::new()
                .reply_for(
                    &AgentKind::Director,
                    r#"{"actors": ["Cyra"], "activate": ["Cyra"], "deactivate": ["Bob"]}"#,
                )
                .with_default("I step off the boat."),
        );
        let orchestrator = Orchestrator::new(scene.handles(provider, quiet()));
        let outcome = orchestrator
            .run_round(RoundInput::user(scene.scene_id, "Nia", "A boat arrives."))
            .await
            .unwrap();

        assert_order(&outcome, &["Cyra"]);
        let stored = scene.store.scene(scene.scene_id).await.unwrap().unwrap();
        assert_eq!(stored.active_participants, vec![scene.alice, 13]);
    }

    #[tokio::test]
    async fn test_nested_input_is_unwrapped() {
        let scene = TestScene::new().await;
        let provider = Arc::new(ScriptedProvider::new().with_default("..."));
        let orchestrator = Orchestrator::new(scene.handles(provider, quiet()));
        let raw = serde_json::json!(r#"{"prompt": "\"Ring the bell.\""}"#);
        orchestrator
            .run_round(RoundInput::raw(scene.scene_id, "Nia", raw))
            .await
            .unwrap();

        let messages = scene.store.messages(scene.scene_id).await.unwrap();
        assert_eq!(messages[0].content, "Ring the bell.");
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_broken_chain_is_fatal() {
        let scene = TestScene::new().await;
        scene
            .store
            .insert_scene(crate::model::Scene {
                id: 200,
                arc_id: Some(99),
                name: "Nowhere".to_string(),
                scenario_notes: None,
                active_participants: vec![],
                persona_id: None,
                current_round_id: None,
            })
            .await;
        let provider = Arc::new(ScriptedProvider::new());
        let orchestrator = Orchestrator::new(scene.handles(provider.clone(), quiet()));

        let err = orchestrator
            .run_round(RoundInput::user(200, "Nia", "Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoundError::BrokenChain { scene_id: 200, .. }));
        assert!(provider.requests().is_empty());
    }

    #[test]
    fn test_group_by_label_keeps_rank_order() {
        let memory = |label: &str, text: &str| RetrievedMemory {
            id: text.to_string(),
            text: text.to_string(),
            adjusted_score: 0.5,
            base_score: 0.5,
            participant_label: label.to_string(),
            scope: crate::memory::MemoryScope::shared(1),
            metadata: Default::default(),
        };
        let groups = group_by_label(vec![
            memory("Alice", "a1"),
            memory("Bob", "b1"),
            memory("Alice", "a2"),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].entries, vec!["a1", "a2"]);
        assert_eq!(groups[1].key, "Bob");
    }
}
