//! Round orchestration, context assembly and scoped long-term memory for
//! multi-character narratives.
//!
//! This crate provides:
//! - A round orchestrator: Director → World → Characters → reconciliation
//! - Token-budgeted context envelopes built from heterogeneous sources
//! - Per-participant memory scopes with decay- and rule-adjusted retrieval
//! - Background vectorization of completed rounds
//!
//! # Quick Start
//!
//! ```ignore
//! use ensemble_core::{
//!     EngineConfig, EngineHandles, HashEmbedder, InMemorySceneStore, MemoryStore,
//!     Orchestrator, RoundInput, StaticConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemorySceneStore::new());
//!     // ... seed a world, campaign, arc, scene and characters ...
//!
//!     let config = Arc::new(StaticConfig::new(EngineConfig::default()));
//!     let memory = Arc::new(MemoryStore::new(Arc::new(HashEmbedder::default()), config.clone()));
//!     let client = Arc::new(ensemble_llm::Client::from_env()?);
//!     let handles = EngineHandles::new(store.clone(), store.clone(), config, memory, client);
//!
//!     let outcome = Orchestrator::new(handles)
//!         .run_round(RoundInput::user(1, "Nia", "The ferry horn sounds."))
//!         .await?;
//!     for line in outcome.lines() {
//!         println!("{line}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod context;
pub mod director;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod testing;
pub mod vectorize;

// Primary public API
pub use agent::{Agent, AgentKind, AgentOutput, CompletionProvider};
pub use config::{ConfigSource, EngineConfig, FileConfig, StaticConfig};
pub use context::{ContextBuilder, ContextEnvelope, ContextSources, TokenBudget};
pub use director::DirectorPlan;
pub use memory::{
    EmbeddingProvider, HashEmbedder, MemoryError, MemoryRetriever, MemoryScope, MemoryStore,
    RetrievalScope,
};
pub use normalize::unwrap_prompt;
pub use orchestrator::{EngineHandles, Orchestrator, RoundError, RoundInput, RoundOutcome};
pub use session::{SessionContext, SessionError};
pub use store::{InMemorySceneStore, SceneStore, StoreError};
pub use testing::{ScriptedProvider, TestScene};
pub use vectorize::{RevectorizeReport, VectorizationAgent, VectorizeError};
