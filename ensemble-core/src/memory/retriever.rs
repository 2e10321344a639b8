//! Ranked memory retrieval across scopes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::boost::apply_boosts;
use super::decay::DecayInput;
use super::{MemoryMetadata, MemoryScope, MemoryStore};
use crate::config::ConfigSource;
use crate::model::{Participant, ParticipantId, SceneId, WorldId};
use crate::store::StoreError;

/// Lists the worlds and participants memories may belong to.
#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    async fn world_ids(&self) -> Result<Vec<WorldId>, StoreError>;
    async fn participants(&self) -> Result<Vec<Participant>, StoreError>;
}

/// Counts scene messages for message-count decay.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Messages logged in `scene_id` strictly after `since`.
    async fn messages_since(
        &self,
        scene_id: SceneId,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Which scopes a retrieval covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrievalScope {
    pub world_id: Option<WorldId>,
    pub participant_id: Option<ParticipantId>,
    pub include_shared: bool,
}

impl RetrievalScope {
    /// Exactly one participant's scope.
    pub fn participant(world_id: WorldId, participant_id: ParticipantId) -> Self {
        Self {
            world_id: Some(world_id),
            participant_id: Some(participant_id),
            include_shared: false,
        }
    }

    /// Every participant in one world.
    pub fn world(world_id: WorldId) -> Self {
        Self {
            world_id: Some(world_id),
            ..Self::default()
        }
    }

    /// Every participant in every world.
    pub fn everywhere() -> Self {
        Self::default()
    }

    pub fn with_shared(mut self) -> Self {
        self.include_shared = true;
        self
    }
}

/// A memory with its adjusted score.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedMemory {
    pub id: String,
    pub text: String,
    pub adjusted_score: f32,
    /// Raw similarity before decay and boosts.
    pub base_score: f32,
    pub participant_label: String,
    pub scope: MemoryScope,
    pub metadata: MemoryMetadata,
}

/// Fans a query out over scopes and ranks the merged results.
pub struct MemoryRetriever {
    store: Arc<MemoryStore>,
    config: Arc<dyn ConfigSource>,
    directory: Arc<dyn ParticipantDirectory>,
    messages: Option<Arc<dyn MessageLog>>,
}

impl MemoryRetriever {
    pub fn new(
        store: Arc<MemoryStore>,
        config: Arc<dyn ConfigSource>,
        directory: Arc<dyn ParticipantDirectory>,
    ) -> Self {
        Self {
            store,
            config,
            directory,
            messages: None,
        }
    }

    /// Enable message-count decay lookups.
    pub fn with_message_log(mut self, messages: Arc<dyn MessageLog>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    async fn participants(&self) -> Vec<Participant> {
        self.directory.participants().await.unwrap_or_else(|e| {
            warn!(error = %e, "Participant directory unavailable");
            Vec::new()
        })
    }

    async fn world_ids(&self) -> Vec<WorldId> {
        self.directory.world_ids().await.unwrap_or_else(|e| {
            warn!(error = %e, "World directory unavailable");
            Vec::new()
        })
    }

    /// Expand a [`RetrievalScope`] into concrete scopes.
    pub async fn resolve_scopes(&self, scope: &RetrievalScope) -> Vec<MemoryScope> {
        let worlds = match scope.world_id {
            Some(world_id) => vec![world_id],
            None => self.world_ids().await,
        };
        let participant_ids: Vec<ParticipantId> = match scope.participant_id {
            Some(id) => vec![id],
            None => self.participants().await.iter().map(|p| p.id).collect(),
        };

        let mut scopes = Vec::new();
        for &world_id in &worlds {
            scopes.extend(
                participant_ids
                    .iter()
                    .map(|&participant_id| MemoryScope::participant(world_id, participant_id)),
            );
            if scope.include_shared {
                scopes.push(MemoryScope::shared(world_id));
            }
        }
        scopes
    }

    /// Retrieve up to `top_k` memories for `query`, best first.
    ///
    /// The query is cut to `memoryCaps.maxQueryChars` and `top_k` clamped to
    /// `memoryCaps.maxTopK`. Each result is decayed, then boosted, then the
    /// merged list is re-sorted by adjusted score.
    pub async fn retrieve(
        &self,
        query: &str,
        scope: &RetrievalScope,
        top_k: usize,
    ) -> Vec<RetrievedMemory> {
        let config = self.config.snapshot().await;
        let caps = &config.memory_caps;

        let top_k = top_k.min(caps.max_top_k);
        if top_k == 0 || query.trim().is_empty() {
            return Vec::new();
        }
        let query: String = query.chars().take(caps.max_query_chars).collect();

        let scopes = self.resolve_scopes(scope).await;
        let labels: HashMap<ParticipantId, String> = self
            .participants()
            .await
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();

        let per_scope = join_all(
            scopes
                .iter()
                .map(|scope| self.store.query(scope, &query, top_k)),
        )
        .await;

        let now = Utc::now();
        let messages = self.messages.as_deref();
        let mut results = Vec::new();
        for hit in per_scope.into_iter().flatten() {
            let decayed = DecayInput {
                metadata: &hit.metadata,
                now,
                messages,
            }
            .apply(hit.score, &config.temporal_decay)
            .await;
            let adjusted = apply_boosts(decayed, &config.conditional_rules, &hit.metadata);

            let participant_label = match hit.scope.participant_id() {
                Some(id) => labels
                    .get(&id)
                    .cloned()
                    .or_else(|| hit.metadata.character_name.clone())
                    .unwrap_or_else(|| format!("Participant {id}")),
                None => "Shared".to_string(),
            };

            results.push(RetrievedMemory {
                id: hit.id,
                text: hit.text,
                adjusted_score: adjusted,
                base_score: hit.score,
                participant_label,
                scope: hit.scope,
                metadata: hit.metadata,
            });
        }

        results.sort_by(|a, b| {
            b.adjusted_score
                .partial_cmp(&a.adjusted_score)
                .unwrap_or(Ordering::Equal)
        });
        results.truncate(top_k);

        debug!(
            scopes = scopes.len(),
            results = results.len(),
            top_k,
            "Retrieved memories"
        );
        results
    }
}
