//! Testing utilities for the engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedProvider` for deterministic agent replies without API calls
//! - `TestScene` for a seeded world, scene and cast
//! - Assertion helpers for round outcomes

use async_trait::async_trait;
use ensemble_llm::ChatRequest;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::agent::{AgentError, AgentKind, CompletionProvider};
use crate::config::{ConfigSource, EngineConfig, StaticConfig};
use crate::memory::{HashEmbedder, MemoryStore};
use crate::model::{
    Campaign, ParticipantId, Participant, Scene, SceneId, StoryArc, World, WorldId,
};
use crate::orchestrator::{EngineHandles, RoundOutcome};
use crate::store::InMemorySceneStore;

type Scripted = Result<String, String>;

/// Text that identifies an agent's system prompt.
fn marker(kind: &AgentKind) -> String {
    match kind {
        AgentKind::Director => "You are the Director".to_string(),
        AgentKind::World => "You track the state of the world".to_string(),
        AgentKind::Character { name, .. } => format!("## You Are\n{name}\n"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Script {
    general: VecDeque<Scripted>,
    routed: Vec<(String, VecDeque<Scripted>)>,
}

/// A completion provider that returns scripted replies.
///
/// Replies routed to an agent with [`ScriptedProvider::reply_for`] are used
/// first, in order. Anything else takes the next general reply, then the
/// default reply once the script runs out. Every request is recorded.
pub struct ScriptedProvider {
    script: Mutex<Script>,
    default_reply: String,
    requests: Mutex<Vec<ChatRequest>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            default_reply: "{}".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for whichever request comes next.
    pub fn reply(self, text: impl Into<String>) -> Self {
        lock(&self.script).general.push_back(Ok(text.into()));
        self
    }

    /// Queue a failed model call.
    pub fn fail(self, message: impl Into<String>) -> Self {
        lock(&self.script).general.push_back(Err(message.into()));
        self
    }

    /// Queue a reply for one agent only.
    pub fn reply_for(self, kind: &AgentKind, text: impl Into<String>) -> Self {
        self.route(kind, Ok(text.into()))
    }

    /// Queue a failed model call for one agent only.
    pub fn fail_for(self, kind: &AgentKind, message: impl Into<String>) -> Self {
        self.route(kind, Err(message.into()))
    }

    fn route(self, kind: &AgentKind, scripted: Scripted) -> Self {
        let needle = marker(kind);
        {
            let mut script = lock(&self.script);
            match script.routed.iter_mut().find(|(n, _)| *n == needle) {
                Some((_, queue)) => queue.push_back(scripted),
                None => script.routed.push((needle, VecDeque::from([scripted]))),
            }
        }
        self
    }

    /// Reply used once the script is exhausted.
    pub fn with_default(mut self, text: impl Into<String>) -> Self {
        self.default_reply = text.into();
        self
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    /// Requests whose system prompt belongs to `kind`.
    pub fn requests_for(&self, kind: &AgentKind) -> Vec<ChatRequest> {
        let needle = marker(kind);
        self.requests()
            .into_iter()
            .filter(|r| r.system.as_deref().is_some_and(|s| s.contains(&needle)))
            .collect()
    }

    fn next(&self, request: &ChatRequest) -> Scripted {
        let system = request.system.as_deref().unwrap_or_default();
        let mut script = lock(&self.script);
        for (needle, queue) in script.routed.iter_mut() {
            if system.contains(needle.as_str()) {
                if let Some(scripted) = queue.pop_front() {
                    return scripted;
                }
            }
        }
        script
            .general
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_reply.clone()))
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String, AgentError> {
        let scripted = self.next(&request);
        lock(&self.requests).push(request);
        scripted.map_err(AgentError::Provider)
    }
}

/// A seeded scene: world "Vale" → campaign → arc → scene "Harbor", with
/// Alice and Bob active and Nia as the persona.
pub struct TestScene {
    pub store: Arc<InMemorySceneStore>,
    pub world_id: WorldId,
    pub scene_id: SceneId,
    pub alice: ParticipantId,
    pub bob: ParticipantId,
    pub persona: ParticipantId,
}

impl TestScene {
    pub async fn new() -> Self {
        let store = Arc::new(InMemorySceneStore::new());
        store
            .insert_world(World {
                id: 1,
                name: "Vale".to_string(),
                description: "A fogbound coast.".to_string(),
            })
            .await;
        store
            .insert_campaign(Campaign {
                id: 2,
                world_id: Some(1),
                name: "Winter Tides".to_string(),
            })
            .await;
        store
            .insert_arc(StoryArc {
                id: 3,
                campaign_id: Some(2),
                name: "Arrival".to_string(),
            })
            .await;
        store
            .insert_participant(Participant::character(10, "Alice").with_description("a harbor pilot"))
            .await;
        store
            .insert_participant(Participant::character(11, "Bob").with_description("a wary smuggler"))
            .await;
        store.insert_participant(Participant::persona(12, "Nia")).await;
        store
            .insert_scene(Scene {
                id: 100,
                arc_id: Some(3),
                name: "Harbor".to_string(),
                scenario_notes: Some("Fog rolls in over the docks.".to_string()),
                active_participants: vec![10, 11],
                persona_id: Some(12),
                current_round_id: None,
            })
            .await;

        Self {
            store,
            world_id: 1,
            scene_id: 100,
            alice: 10,
            bob: 11,
            persona: 12,
        }
    }

    /// Add another character who is not yet active.
    pub async fn add_character(&self, id: ParticipantId, name: &str) {
        self.store.insert_participant(Participant::character(id, name)).await;
    }

    /// An in-memory store backed by [`HashEmbedder`].
    pub fn memory_store(&self, config: EngineConfig) -> Arc<MemoryStore> {
        let config: Arc<dyn ConfigSource> = Arc::new(StaticConfig::new(config));
        Arc::new(MemoryStore::new(Arc::new(HashEmbedder::default()), config))
    }

    /// Engine handles over this scene, an in-memory memory store and
    /// `provider`.
    pub fn handles(&self, provider: Arc<ScriptedProvider>, config: EngineConfig) -> EngineHandles {
        let config: Arc<dyn ConfigSource> = Arc::new(StaticConfig::new(config));
        let memory = Arc::new(MemoryStore::new(
            Arc::new(HashEmbedder::default()),
            config.clone(),
        ));
        EngineHandles::new(
            self.store.clone(),
            self.store.clone(),
            config,
            memory,
            provider,
        )
        .with_message_log(self.store.clone())
    }
}

/// Assert that `outcome` has a line spoken by `name`.
pub fn assert_spoke(outcome: &RoundOutcome, name: &str) {
    assert!(
        outcome.responses.iter().any(|r| r.participant.name == name),
        "Expected {} to speak; lines were {:?}",
        name,
        outcome.lines()
    );
}

/// Assert the speaking order of a round.
pub fn assert_order(outcome: &RoundOutcome, names: &[&str]) {
    let actual: Vec<&str> = outcome
        .responses
        .iter()
        .map(|r| r.participant.name.as_str())
        .collect();
    assert_eq!(actual, names, "Unexpected speaking order");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_llm::Message;

    fn request(system: &str) -> ChatRequest {
        ChatRequest::new(vec![Message::user("go")]).with_system(system)
    }

    #[tokio::test]
    async fn test_routed_replies_take_precedence() {
        let alice = AgentKind::character(10, "Alice");
        let provider = ScriptedProvider::new()
            .reply("general")
            .reply_for(&alice, "routed");

        let system = format!("prompt\n{}", marker(&alice));
        assert_eq!(provider.complete(request(&system)).await.unwrap(), "routed");
        assert_eq!(provider.complete(request(&system)).await.unwrap(), "general");
        assert_eq!(provider.complete(request(&system)).await.unwrap(), "{}");
        assert_eq!(provider.requests_for(&alice).len(), 3);
    }

    #[tokio::test]
    async fn test_failures_are_provider_errors() {
        let provider = ScriptedProvider::new().fail("down");
        let err = provider.complete(request("x")).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(m) if m == "down"));
    }

    #[tokio::test]
    async fn test_scene_fixture_resolves() {
        let scene = TestScene::new().await;
        let ctx = crate::session::SessionContext::resolve(scene.store.as_ref(), scene.scene_id)
            .await
            .unwrap();
        assert_eq!(ctx.participant_names(), vec!["Alice", "Bob"]);
        assert_eq!(ctx.world.name, "Vale");
    }
}
