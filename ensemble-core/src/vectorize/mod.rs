//! Turning completed rounds into long-term memories.
//!
//! After a round completes, the [`VectorizationAgent`] chunks its transcript
//! and gives every active participant its own copy of every chunk, stored in
//! that participant's scope. It runs off the response path: failures are
//! logged and counted, never surfaced to the round.

mod chunk;

pub use chunk::{chunk_round, transcript, transcript_header, truncate_line, Chunk};

use serde_json::{json, Map};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigSource;
use crate::memory::{DeleteOptions, MemoryMetadata, MemoryScope, MemoryStore, ROUND_MEMORY};
use crate::model::{Participant, RoundId, SceneId};
use crate::session::{SessionContext, SessionError};
use crate::store::{SceneStore, StoreError};

#[derive(Debug, Error)]
pub enum VectorizeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Round {0} not found")]
    RoundNotFound(RoundId),
}

/// Result of vectorizing one round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundVectorization {
    pub round_id: RoundId,
    pub chunks: usize,
    /// Entries written, counting each participant's copy.
    pub stored: usize,
    pub failed: usize,
    /// Vectorization is switched off in config.
    pub skipped: bool,
}

/// Result of re-vectorizing a whole scene.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevectorizeReport {
    pub scene_id: SceneId,
    pub rounds: usize,
    pub rounds_vectorized: usize,
    pub failed_rounds: Vec<RoundId>,
    pub entries_stored: usize,
    pub entries_failed: usize,
    /// Existing entries removed before re-running.
    pub deleted: usize,
}

pub struct VectorizationAgent {
    store: Arc<dyn SceneStore>,
    memory: Arc<MemoryStore>,
    config: Arc<dyn ConfigSource>,
}

impl VectorizationAgent {
    pub fn new(
        store: Arc<dyn SceneStore>,
        memory: Arc<MemoryStore>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            store,
            memory,
            config,
        }
    }

    /// Vectorize `round_id` on the runtime. Errors are logged.
    pub fn spawn_round(self: &Arc<Self>, round_id: RoundId) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = agent.vectorize_round(round_id).await {
                warn!(round_id, error = %e, "Round vectorization failed");
            }
        })
    }

    async fn recipients(&self, ids: &[i64]) -> Result<Vec<Participant>, StoreError> {
        let mut recipients = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.store.participant(id).await? {
                Some(p) => recipients.push(p),
                None => warn!(participant_id = id, "Skipping unknown participant"),
            }
        }
        Ok(recipients)
    }

    /// Chunk one round and store a copy of each chunk for every active
    /// participant. The round is marked vectorized when nothing failed.
    pub async fn vectorize_round(&self, round_id: RoundId) -> Result<RoundVectorization, VectorizeError> {
        let config = self.config.snapshot().await.vectorization;
        let mut result = RoundVectorization {
            round_id,
            ..RoundVectorization::default()
        };
        if !config.enabled {
            debug!(round_id, "Vectorization disabled");
            result.skipped = true;
            return Ok(result);
        }

        let round = self
            .store
            .round(round_id)
            .await?
            .ok_or(VectorizeError::RoundNotFound(round_id))?;
        let session = SessionContext::resolve(self.store.as_ref(), round.scene_id).await?;
        let messages = self.store.round_messages(round_id).await?;
        let recipients = self.recipients(&round.active_participants).await?;

        let names: Vec<String> = recipients.iter().map(|p| p.name.clone()).collect();
        let chunks = chunk_round(round.number, &names, &messages, &config);
        result.chunks = chunks.len();

        let mut actors: Vec<String> = Vec::new();
        for message in &messages {
            if !actors.contains(&message.speaker) {
                actors.push(message.speaker.clone());
            }
        }

        for recipient in &recipients {
            let scope = MemoryScope::participant(session.world_id(), recipient.id);
            for (index, chunk) in chunks.iter().enumerate() {
                let metadata = MemoryMetadata {
                    round_id: Some(round.id),
                    round_number: Some(round.number),
                    scene_id: Some(session.scene_id()),
                    scene_name: Some(session.scene.name.clone()),
                    character_id: Some(recipient.id),
                    character_name: Some(recipient.name.clone()),
                    world_id: Some(session.world_id()),
                    world_name: Some(session.world.name.clone()),
                    actors: actors.clone(),
                    kind: Some(ROUND_MEMORY.to_string()),
                    chunk_index: Some(index),
                    chunk_count: Some(chunks.len()),
                    campaign_id: Some(session.campaign.id),
                    arc_id: Some(session.arc.id),
                    message_ids: chunk.message_ids.clone(),
                    speaker_ids: chunk.speaker_ids.clone(),
                    ..MemoryMetadata::default()
                };
                match self.memory.add(&scope, &chunk.text, metadata).await {
                    Some(_) => result.stored += 1,
                    None => {
                        warn!(round_id, %scope, chunk = index, "Chunk not stored");
                        result.failed += 1;
                    }
                }
            }
        }

        if result.failed == 0 {
            self.store.mark_vectorized(round_id).await?;
        }
        info!(
            round_id,
            chunks = result.chunks,
            stored = result.stored,
            failed = result.failed,
            "Vectorized round"
        );
        Ok(result)
    }

    /// Re-run vectorization for every round of a scene, optionally deleting
    /// what was stored for the scene before.
    pub async fn revectorize_scene(
        &self,
        scene_id: SceneId,
        delete_existing: bool,
    ) -> Result<RevectorizeReport, VectorizeError> {
        let rounds = self.store.rounds(scene_id).await?;
        let mut report = RevectorizeReport {
            scene_id,
            rounds: rounds.len(),
            ..RevectorizeReport::default()
        };

        if delete_existing {
            let mut filter = Map::new();
            filter.insert("sceneId".to_string(), json!(scene_id));
            match self
                .memory
                .delete_by_filter(&filter, None, DeleteOptions::confirmed())
                .await
            {
                Ok(deleted) => report.deleted = deleted.deleted,
                Err(e) => warn!(scene_id, error = %e, "Could not delete existing scene memories"),
            }
        }

        for round in rounds {
            match self.vectorize_round(round.id).await {
                Ok(result) => {
                    report.entries_stored += result.stored;
                    report.entries_failed += result.failed;
                    if result.failed == 0 {
                        report.rounds_vectorized += 1;
                    } else {
                        report.failed_rounds.push(round.id);
                    }
                }
                Err(e) => {
                    warn!(scene_id, round_id = round.id, error = %e, "Round re-vectorization failed");
                    report.failed_rounds.push(round.id);
                }
            }
        }

        info!(
            scene_id,
            rounds = report.rounds,
            vectorized = report.rounds_vectorized,
            deleted = report.deleted,
            "Re-vectorized scene"
        );
        Ok(report)
    }
}
