//! Memory store and retriever behaviour: scope isolation, decay, boosting,
//! caps and bulk-delete safety.
//!
//! Run with: `cargo test -p ensemble-core --test memory_ranking`

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ensemble_core::config::{
    ConditionalRule, ConfigSource, EngineConfig, MemoryCaps, StaticConfig, TemporalDecayConfig,
};
use ensemble_core::memory::{
    DeleteOptions, EmbeddingProvider, HashEmbedder, MemoryError, MemoryMetadata,
    MemoryRetriever, MemoryScope, MemoryStore, RetrievalScope, RetrievedMemory,
};
use ensemble_core::model::{MessageRole, NewMessage};
use ensemble_core::store::SceneStore;
use ensemble_core::testing::TestScene;
use serde_json::{json, Map};
use std::sync::{Arc, Mutex};

/// Records every text it is asked to embed.
#[derive(Default)]
struct RecordingEmbedder {
    inner: HashEmbedder,
    seen: Mutex<Vec<String>>,
}

impl RecordingEmbedder {
    fn last(&self) -> Option<String> {
        self.seen.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl EmbeddingProvider for RecordingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        self.seen.lock().unwrap().push(text.to_string());
        self.inner.embed(text).await
    }
}

struct Engine {
    memory: Arc<MemoryStore>,
    retriever: MemoryRetriever,
}

fn engine(scene: &TestScene, config: EngineConfig, embedder: Arc<dyn EmbeddingProvider>) -> Engine {
    let config: Arc<dyn ConfigSource> = Arc::new(StaticConfig::new(config));
    let memory = Arc::new(MemoryStore::new(embedder, config.clone()));
    let retriever = MemoryRetriever::new(memory.clone(), config, scene.store.clone())
        .with_message_log(scene.store.clone());
    Engine { memory, retriever }
}

fn hours_ago(hours: i64) -> MemoryMetadata {
    MemoryMetadata {
        timestamp: Some((Utc::now() - Duration::hours(hours)).to_rfc3339()),
        ..MemoryMetadata::default()
    }
}

fn score_of(results: &[RetrievedMemory], id: &str) -> f32 {
    results
        .iter()
        .find(|r| r.id == id)
        .map(|r| r.adjusted_score)
        .unwrap_or_else(|| panic!("memory {id} missing from results"))
}

const TEXT: &str = "Alice and Bob argued on the pier about the missing lantern.";

// =============================================================================
// SCOPES
// =============================================================================

#[tokio::test]
async fn test_scope_names() {
    assert_eq!(MemoryScope::participant(3, 7).to_string(), "world_3_char_7");
    assert_eq!(MemoryScope::shared(3).to_string(), "world_3_multi");
    assert_eq!(
        "world_3_char_7".parse::<MemoryScope>().unwrap(),
        MemoryScope::participant(3, 7)
    );
    assert!("world_x_multi".parse::<MemoryScope>().is_err());
}

#[tokio::test]
async fn test_scope_isolation() {
    let scene = TestScene::new().await;
    let e = engine(&scene, EngineConfig::default(), Arc::new(HashEmbedder::default()));
    let alice = MemoryScope::participant(scene.world_id, scene.alice);
    let bob = MemoryScope::participant(scene.world_id, scene.bob);

    e.memory.add(&alice, "Alice hid the lantern.", MemoryMetadata::default()).await.unwrap();
    e.memory.add(&bob, "Bob found the lantern.", MemoryMetadata::default()).await.unwrap();
    e.memory
        .add(&MemoryScope::shared(scene.world_id), "The lantern is old.", MemoryMetadata::default())
        .await
        .unwrap();

    let only_alice = e
        .retriever
        .retrieve("lantern", &RetrievalScope::participant(scene.world_id, scene.alice), 10)
        .await;
    assert_eq!(only_alice.len(), 1);
    assert_eq!(only_alice[0].participant_label, "Alice");
    assert_eq!(only_alice[0].scope, alice);

    let world = e
        .retriever
        .retrieve("lantern", &RetrievalScope::world(scene.world_id), 10)
        .await;
    assert_eq!(world.len(), 2);
    assert!(world.iter().all(|r| !r.scope.is_shared()));

    let with_shared = e
        .retriever
        .retrieve("lantern", &RetrievalScope::world(scene.world_id).with_shared(), 10)
        .await;
    assert_eq!(with_shared.len(), 3);
    assert!(with_shared.iter().any(|r| r.participant_label == "Shared"));

    let everywhere = e
        .retriever
        .retrieve("lantern", &RetrievalScope::everywhere(), 10)
        .await;
    assert_eq!(everywhere.len(), 2);
}

// =============================================================================
// DECAY
// =============================================================================

#[tokio::test]
async fn test_time_decay_is_monotonic() {
    let scene = TestScene::new().await;
    let config = EngineConfig::default().with_temporal_decay(TemporalDecayConfig::time(10.0, 0.0));
    let e = engine(&scene, config, Arc::new(HashEmbedder::default()));
    let scope = MemoryScope::participant(scene.world_id, scene.alice);

    let fresh = e.memory.add(&scope, TEXT, hours_ago(1)).await.unwrap();
    let older = e.memory.add(&scope, TEXT, hours_ago(10)).await.unwrap();
    let oldest = e.memory.add(&scope, TEXT, hours_ago(100)).await.unwrap();

    let results = e
        .retriever
        .retrieve(TEXT, &RetrievalScope::participant(scene.world_id, scene.alice), 10)
        .await;
    assert_eq!(results.len(), 3);
    let (a, b, c) = (
        score_of(&results, &fresh),
        score_of(&results, &older),
        score_of(&results, &oldest),
    );
    assert!(a > b && b > c, "expected {a} > {b} > {c}");
    assert!((b - results[0].base_score * 0.5).abs() < 0.01);
    assert_eq!(results[0].id, fresh);
}

#[tokio::test]
async fn test_message_count_decay_is_monotonic() {
    let scene = TestScene::new().await;
    let config =
        EngineConfig::default().with_temporal_decay(TemporalDecayConfig::message_count(5.0, 0.1));
    let e = engine(&scene, config, Arc::new(HashEmbedder::default()));
    let scope = MemoryScope::participant(scene.world_id, scene.alice);

    let mut ids = Vec::new();
    for age in [0u64, 5, 50] {
        let metadata = MemoryMetadata {
            message_age: Some(age),
            ..MemoryMetadata::default()
        };
        ids.push(e.memory.add(&scope, TEXT, metadata).await.unwrap());
    }

    let results = e
        .retriever
        .retrieve(TEXT, &RetrievalScope::participant(scene.world_id, scene.alice), 10)
        .await;
    let scores: Vec<f32> = ids.iter().map(|id| score_of(&results, id)).collect();
    assert!(scores[0] > scores[1] && scores[1] > scores[2]);
    // Fifty messages is far past the floor.
    assert!((scores[2] - results[0].base_score * 0.1).abs() < 0.01);
}

#[tokio::test]
async fn test_message_count_decay_reads_message_log() {
    let scene = TestScene::new().await;
    let config =
        EngineConfig::default().with_temporal_decay(TemporalDecayConfig::message_count(2.0, 0.0));
    let e = engine(&scene, config, Arc::new(HashEmbedder::default()));
    let scope = MemoryScope::participant(scene.world_id, scene.alice);

    let scene_metadata = |hours: i64| MemoryMetadata {
        scene_id: Some(scene.scene_id),
        ..hours_ago(hours)
    };
    let before = e.memory.add(&scope, TEXT, scene_metadata(1)).await.unwrap();
    let round = scene
        .store
        .begin_round(scene.scene_id, vec![scene.alice])
        .await
        .unwrap();
    for line in ["one", "two"] {
        scene
            .store
            .append_message(NewMessage {
                scene_id: scene.scene_id,
                round_id: round.id,
                speaker: "Alice".to_string(),
                speaker_id: Some(scene.alice),
                role: MessageRole::Character,
                content: line.to_string(),
            })
            .await
            .unwrap();
    }
    let after = e.memory.add(&scope, TEXT, scene_metadata(-1)).await.unwrap();

    let results = e
        .retriever
        .retrieve(TEXT, &RetrievalScope::participant(scene.world_id, scene.alice), 10)
        .await;
    let base = results[0].base_score;
    assert!((score_of(&results, &after) - base).abs() < 1e-4);
    // Two messages at a half-life of two.
    assert!((score_of(&results, &before) - base * 0.5).abs() < 1e-3);
}

#[tokio::test]
async fn test_decay_exempt_and_malformed_timestamps() {
    let scene = TestScene::new().await;
    let config = EngineConfig::default().with_temporal_decay(TemporalDecayConfig::time(1.0, 0.0));
    let e = engine(&scene, config, Arc::new(HashEmbedder::default()));
    let scope = MemoryScope::participant(scene.world_id, scene.alice);

    let exempt = e
        .memory
        .add(
            &scope,
            TEXT,
            MemoryMetadata {
                decay_exempt: true,
                ..hours_ago(500)
            },
        )
        .await
        .unwrap();
    let malformed = e
        .memory
        .add(
            &scope,
            TEXT,
            MemoryMetadata {
                timestamp: Some("last tuesday".to_string()),
                ..MemoryMetadata::default()
            },
        )
        .await
        .unwrap();
    let decayed = e.memory.add(&scope, TEXT, hours_ago(500)).await.unwrap();

    let results = e
        .retriever
        .retrieve(TEXT, &RetrievalScope::participant(scene.world_id, scene.alice), 10)
        .await;
    for id in [&exempt, &malformed] {
        let r = results.iter().find(|r| &r.id == id).unwrap();
        assert_eq!(r.adjusted_score, r.base_score);
    }
    assert!(score_of(&results, &decayed) < 0.01);
}

// =============================================================================
// BOOSTING AND CAPS
// =============================================================================

#[tokio::test]
async fn test_conditional_boosts_compose() {
    let scene = TestScene::new().await;
    let config = EngineConfig::default()
        .with_rule(ConditionalRule::exact("characterName", "ALICE", 2.0))
        .with_rule(ConditionalRule::substring("metadata.actors", "bo", 1.5))
        .with_rule(ConditionalRule::exact("missing.field", "x", 10.0));
    let e = engine(&scene, config, Arc::new(HashEmbedder::default()));
    let scope = MemoryScope::participant(scene.world_id, scene.alice);

    let both = e
        .memory
        .add(
            &scope,
            TEXT,
            MemoryMetadata {
                character_name: Some("Alice".to_string()),
                actors: vec!["Alice".to_string(), "Bob".to_string()],
                ..MemoryMetadata::default()
            },
        )
        .await
        .unwrap();
    let plain = e.memory.add(&scope, TEXT, MemoryMetadata::default()).await.unwrap();

    let results = e
        .retriever
        .retrieve(TEXT, &RetrievalScope::participant(scene.world_id, scene.alice), 10)
        .await;
    let base = results[0].base_score;
    assert_eq!(results[0].id, both);
    assert!((score_of(&results, &both) - base * 3.0).abs() < 1e-3);
    assert!((score_of(&results, &plain) - base).abs() < 1e-4);
}

#[tokio::test]
async fn test_query_and_top_k_are_clamped() {
    let scene = TestScene::new().await;
    let config = EngineConfig::default().with_memory_caps(MemoryCaps {
        max_top_k: 3,
        max_query_chars: 10,
    });
    let embedder = Arc::new(RecordingEmbedder::default());
    let e = engine(&scene, config, embedder.clone());
    let scope = MemoryScope::participant(scene.world_id, scene.alice);
    for i in 0..10 {
        e.memory
            .add(&scope, &format!("lantern memory {i}"), MemoryMetadata::default())
            .await
            .unwrap();
    }

    let long_query = "lantern ".repeat(100);
    let results = e
        .retriever
        .retrieve(&long_query, &RetrievalScope::participant(scene.world_id, scene.alice), 100)
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(embedder.last().unwrap().chars().count(), 10);
    for pair in results.windows(2) {
        assert!(pair[0].adjusted_score >= pair[1].adjusted_score);
    }
}

// =============================================================================
// BULK DELETE
// =============================================================================

#[tokio::test]
async fn test_bulk_delete_needs_confirmation() {
    let scene = TestScene::new().await;
    let e = engine(&scene, EngineConfig::default(), Arc::new(HashEmbedder::default()));
    let alice = MemoryScope::participant(scene.world_id, scene.alice);
    let bob = MemoryScope::participant(scene.world_id, scene.bob);

    for i in 0..55 {
        let scope = if i < 30 { &alice } else { &bob };
        let metadata = MemoryMetadata {
            scene_id: Some(7),
            ..MemoryMetadata::default()
        };
        e.memory.add(scope, &format!("entry {i}"), metadata).await.unwrap();
    }
    e.memory
        .add(&alice, "another scene", MemoryMetadata {
            scene_id: Some(8),
            ..MemoryMetadata::default()
        })
        .await
        .unwrap();

    let mut filter = Map::new();
    filter.insert("sceneId".to_string(), json!(7));

    let err = e
        .memory
        .delete_by_filter(&filter, None, DeleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::BulkDeleteRejected {
            matched: 55,
            threshold: 50
        }
    ));
    assert_eq!(e.memory.count(&alice).await, 31);
    assert_eq!(e.memory.count(&bob).await, 25);

    // Previewing a large match set needs no confirmation.
    let unconfirmed = e
        .memory
        .delete_by_filter(&filter, None, DeleteOptions::dry_run())
        .await
        .unwrap();
    assert_eq!(unconfirmed.matched, 55);
    assert_eq!(unconfirmed.deleted, 0);
    assert_eq!(e.memory.count(&alice).await, 31);

    let report = e
        .memory
        .delete_by_filter(&filter, None, DeleteOptions::confirmed())
        .await
        .unwrap();
    assert_eq!(report.deleted, 55);
    assert_eq!(e.memory.count(&alice).await, 1);
    assert_eq!(e.memory.count(&bob).await, 0);
}

#[tokio::test]
async fn test_small_delete_needs_no_confirmation() {
    let scene = TestScene::new().await;
    let e = engine(&scene, EngineConfig::default(), Arc::new(HashEmbedder::default()));
    let alice = MemoryScope::participant(scene.world_id, scene.alice);
    for i in 0..3 {
        e.memory
            .add(&alice, &format!("entry {i}"), MemoryMetadata {
                round_id: Some(i),
                ..MemoryMetadata::default()
            })
            .await
            .unwrap();
    }

    let mut filter = Map::new();
    filter.insert("roundId".to_string(), json!(1));
    let report = e
        .memory
        .delete_by_filter(&filter, Some(&alice), DeleteOptions::default())
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(e.memory.count(&alice).await, 2);
}
