//! Prompt text for each agent.

use serde_json::Value;

use super::AgentKind;
use crate::context::ContextEnvelope;

/// System prompt for `kind`.
pub fn system_prompt(kind: &AgentKind) -> String {
    let mut prompt = String::new();
    match kind {
        AgentKind::Director => {
            prompt.push_str(include_str!("prompts/director.txt"));
            prompt.push('\n');
            prompt.push_str(include_str!("prompts/director_format.txt"));
        }
        AgentKind::World => prompt.push_str(include_str!("prompts/world.txt")),
        AgentKind::Character { name, .. } => {
            prompt.push_str(include_str!("prompts/character.txt"));
            prompt.push_str(&format!("\n## You Are\n{name}\n"));
        }
    }
    prompt
}

/// Notice appended to a JSON request after an invalid reply.
pub fn retry_notice(errors: &[String]) -> String {
    let mut notice = include_str!("prompts/json_retry.txt").to_string();
    for error in errors {
        notice.push_str(&format!("- {error}\n"));
    }
    notice
}

fn push_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("## {heading}\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
    out.push('\n');
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render an envelope as the user message body.
pub fn render_envelope(envelope: &ContextEnvelope) -> String {
    let mut out = String::new();

    if envelope.director_pass() > 1 {
        out.push_str(&format!("Director pass: {}\n\n", envelope.director_pass()));
    }

    push_list(&mut out, "Story So Far", envelope.summaries());
    push_list(&mut out, "World Lore", envelope.lore());
    push_list(&mut out, "Scenario Notes", envelope.scenario_notes());
    push_list(&mut out, "Characters", envelope.character_summaries());

    if let Some(persona) = envelope.persona_summary() {
        out.push_str(&format!("## Persona\n{persona}\n\n"));
    }

    if !envelope.state_snapshots().is_empty() {
        out.push_str("## Character State\n");
        for (name, state) in envelope.state_snapshots() {
            let fields: Vec<String> = state
                .iter()
                .map(|(k, v)| format!("{k}: {}", render_value(v)))
                .collect();
            out.push_str(&format!("- {name}: {}\n", fields.join(", ")));
        }
        out.push('\n');
    }

    if !envelope.memories().is_empty() {
        out.push_str("## Memories\n");
        for group in envelope.memories() {
            out.push_str(&format!("### {}\n", group.key));
            for entry in &group.entries {
                out.push_str(&format!("- {entry}\n"));
            }
        }
        out.push('\n');
    }

    if !envelope.history().is_empty() {
        out.push_str("## Recent History\n");
        for line in envelope.history() {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }

    if let Some(guidance) = envelope.director_guidance() {
        out.push_str(&format!("## Director Guidance\n{guidance}\n\n"));
    }
    if let Some(guidance) = envelope.character_guidance() {
        out.push_str(&format!("## Guidance For You\n{guidance}\n\n"));
    }

    push_list(&mut out, "This Round", envelope.round_responses());
    out
}

/// Full user message: rendered context followed by the task.
pub fn user_prompt(envelope: &ContextEnvelope, task: &str) -> String {
    let mut prompt = render_envelope(envelope);
    prompt.push_str("## Task\n");
    prompt.push_str(task);
    prompt.push('\n');
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextBuilder, ContextSources, MemoryGroup};

    #[test]
    fn test_character_system_prompt_names_character() {
        let kind = AgentKind::character(1, "Alice");
        let prompt = system_prompt(&kind);
        assert!(prompt.contains("## You Are\nAlice"));
        assert!(!system_prompt(&AgentKind::World).contains("You Are"));
    }

    #[test]
    fn test_render_sections() {
        let envelope = ContextBuilder::default().build(ContextSources {
            history: vec!["Bob: Later.".to_string(), "Alice: Hi!".to_string()],
            memories: vec![MemoryGroup::new("This round", vec!["Alice: Hi!".to_string()])],
            director_guidance: Some("Keep it brisk".to_string()),
            ..ContextSources::default()
        });
        let text = render_envelope(&envelope);

        assert!(text.contains("## Recent History\nAlice: Hi!\nBob: Later.\n"));
        assert!(text.contains("### This round\n- Alice: Hi!"));
        assert!(text.contains("## Director Guidance\nKeep it brisk"));
        assert!(!text.contains("Director pass"));
    }

    #[test]
    fn test_reconciliation_marker() {
        let envelope = ContextBuilder::default()
            .build(ContextSources::default())
            .with_director_pass(2)
            .with_round_responses(vec!["Alice: Hi!".to_string()]);
        let text = render_envelope(&envelope);
        assert!(text.starts_with("Director pass: 2"));
        assert!(text.contains("## This Round\n- Alice: Hi!"));
    }

    #[test]
    fn test_retry_notice_lists_errors() {
        let notice = retry_notice(&["\"actors\" must be an array".to_string()]);
        assert!(notice.contains("previous response was invalid"));
        assert!(notice.contains("- \"actors\" must be an array"));
    }
}
