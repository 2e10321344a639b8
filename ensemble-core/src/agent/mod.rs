//! Model-backed agents: Director, World and Character.
//!
//! Every agent call goes through [`Agent::run`], which resolves the model
//! profile for the agent, renders the context envelope, validates structured
//! replies (retrying with a notice when they are malformed) and falls back to
//! canned output when the model call itself fails. A round therefore always
//! gets *some* output from every step.

mod json;
mod prompt;

pub use json::{
    extract_json, failed_validation, is_failed_validation, parse_object, validate_director,
    validate_world, FAILED_JSON_VALIDATION,
};
pub use prompt::{render_envelope, retry_notice, system_prompt, user_prompt};

use async_trait::async_trait;
use ensemble_llm::{ChatRequest, Message};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AgentProfile, EngineConfig};
use crate::context::ContextEnvelope;
use crate::model::ParticipantId;

/// JSON validation retries when no profile sets `maxRetries`.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Completion budget when no profile sets `maxTokens`.
pub const DEFAULT_MAX_TOKENS: usize = 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] ensemble_llm::Error),

    #[error("Provider error: {0}")]
    Provider(String),
}

/// Anything that can answer a chat request with text.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, AgentError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentKind {
    Director,
    World,
    Character { id: ParticipantId, name: String },
}

impl AgentKind {
    pub fn character(id: ParticipantId, name: impl Into<String>) -> Self {
        AgentKind::Character {
            id,
            name: name.into(),
        }
    }

    /// Routing key and log label.
    pub fn label(&self) -> String {
        match self {
            AgentKind::Director => "director".to_string(),
            AgentKind::World => "world".to_string(),
            AgentKind::Character { name, .. } => format!("character:{name}"),
        }
    }

    pub fn expects_json(&self) -> bool {
        !matches!(self, AgentKind::Character { .. })
    }

    fn validate(&self, value: &Value) -> Vec<String> {
        match self {
            AgentKind::Director => validate_director(value),
            AgentKind::World => validate_world(value),
            AgentKind::Character { .. } => Vec::new(),
        }
    }

    /// Canned output used when the model cannot be reached.
    pub fn fallback(&self) -> AgentContent {
        match self {
            AgentKind::Director => AgentContent::Json(json!({ "actors": [] })),
            AgentKind::World => AgentContent::Json(json!({ "stateUpdates": {} })),
            AgentKind::Character { name, .. } => {
                AgentContent::Text(format!("{name} pauses, saying nothing for now."))
            }
        }
    }
}

/// Merge profiles from most to least specific: `character:{name}`,
/// `character`, then `default`.
pub fn resolve_profile(agents: &BTreeMap<String, AgentProfile>, kind: &AgentKind) -> AgentProfile {
    let fallback = agents.get("default").cloned().unwrap_or_default();
    let general = match kind {
        AgentKind::Director => agents.get("director"),
        AgentKind::World => agents.get("world"),
        AgentKind::Character { .. } => agents.get("character"),
    }
    .cloned()
    .unwrap_or_default()
    .or(&fallback);

    match kind {
        AgentKind::Character { .. } => agents
            .get(&kind.label())
            .cloned()
            .unwrap_or_default()
            .or(&general),
        _ => general,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentContent {
    Text(String),
    Json(Value),
}

/// What one agent call produced.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub kind: AgentKind,
    pub content: AgentContent,
    /// The model call failed and `content` is the canned fallback.
    pub fallback: bool,
    /// Model calls made, including retries.
    pub attempts: u32,
}

impl AgentOutput {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            AgentContent::Text(text) => Some(text),
            AgentContent::Json(_) => None,
        }
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.content {
            AgentContent::Json(value) => Some(value),
            AgentContent::Text(_) => None,
        }
    }

    pub fn validation_failed(&self) -> bool {
        self.json().is_some_and(is_failed_validation)
    }
}

/// One agent bound to a completion provider.
pub struct Agent {
    kind: AgentKind,
    provider: Arc<dyn CompletionProvider>,
}

impl Agent {
    pub fn new(kind: AgentKind, provider: Arc<dyn CompletionProvider>) -> Self {
        Self { kind, provider }
    }

    pub fn kind(&self) -> &AgentKind {
        &self.kind
    }

    fn request(&self, envelope: &ContextEnvelope, task: &str, profile: &AgentProfile) -> ChatRequest {
        let mut system = system_prompt(&self.kind);
        if envelope.director_pass() > 1 && self.kind == AgentKind::Director {
            system.push('\n');
            system.push_str(include_str!("prompts/reconciliation.txt"));
        }

        let mut request = ChatRequest::new(vec![Message::user(user_prompt(envelope, task))])
            .with_system(system)
            .with_max_tokens(profile.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS))
            .with_json_mode(self.kind.expects_json());
        if let Some(model) = &profile.model {
            request = request.with_model(model);
        }
        if let Some(temperature) = profile.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    fn fallback(&self, attempts: u32) -> AgentOutput {
        AgentOutput {
            kind: self.kind.clone(),
            content: self.kind.fallback(),
            fallback: true,
            attempts,
        }
    }

    /// Run the agent once over `envelope`.
    pub async fn run(&self, envelope: &ContextEnvelope, task: &str, config: &EngineConfig) -> AgentOutput {
        let label = self.kind.label();
        let profile = resolve_profile(&config.agents, &self.kind);
        let base = self.request(envelope, task, &profile);

        if !self.kind.expects_json() {
            return match self.provider.complete(base).await {
                Ok(reply) => match self.clean_text(&reply) {
                    Some(text) => AgentOutput {
                        kind: self.kind.clone(),
                        content: AgentContent::Text(text),
                        fallback: false,
                        attempts: 1,
                    },
                    None => {
                        warn!(agent = %label, "Empty reply, using fallback");
                        self.fallback(1)
                    }
                },
                Err(e) => {
                    warn!(agent = %label, error = %e, "Model call failed, using fallback");
                    self.fallback(1)
                }
            };
        }

        let max_retries = profile.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let mut request = base.clone();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let reply = match self.provider.complete(request).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(agent = %label, error = %e, "Model call failed, using fallback");
                    return self.fallback(attempts);
                }
            };

            let errors = match parse_object(&reply) {
                Ok(value) => {
                    let problems = self.kind.validate(&value);
                    if problems.is_empty() {
                        debug!(agent = %label, attempts, "Agent reply accepted");
                        return AgentOutput {
                            kind: self.kind.clone(),
                            content: AgentContent::Json(value),
                            fallback: false,
                            attempts,
                        };
                    }
                    problems
                }
                Err(problems) => problems,
            };

            warn!(agent = %label, attempt = attempts, errors = ?errors, "Invalid JSON reply");
            if attempts > max_retries {
                return AgentOutput {
                    kind: self.kind.clone(),
                    content: AgentContent::Json(failed_validation(&errors)),
                    fallback: false,
                    attempts,
                };
            }

            // The rejected reply is never echoed back.
            request = base.clone();
            request.messages.push(Message::user(retry_notice(&errors)));
        }
    }

    /// Trim a character reply and drop a leading `"Name:"` the model added.
    fn clean_text(&self, reply: &str) -> Option<String> {
        let mut text = reply.trim();
        if let AgentKind::Character { name, .. } = &self.kind {
            if let Some(rest) = text.strip_prefix(name.as_str()) {
                if let Some(rest) = rest.strip_prefix(':') {
                    text = rest.trim_start();
                }
            }
        }
        (!text.is_empty()).then(|| text.to_string())
    }
}
