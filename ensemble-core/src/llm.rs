//! [`ensemble_llm::Client`] as the engine's completion and embedding backend.

use async_trait::async_trait;
use ensemble_llm::{ChatRequest, Client};
use tracing::debug;

use crate::agent::{AgentError, CompletionProvider};
use crate::memory::{EmbeddingProvider, MemoryError};

#[async_trait]
impl CompletionProvider for Client {
    async fn complete(&self, request: ChatRequest) -> Result<String, AgentError> {
        let response = Client::complete(self, request).await?;
        if let Some(usage) = response.usage {
            debug!(
                model = %response.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Completion usage"
            );
        }
        Ok(response.content)
    }
}

#[async_trait]
impl EmbeddingProvider for Client {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Client::embed(self, text)
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))
    }
}
