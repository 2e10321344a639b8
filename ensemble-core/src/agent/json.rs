//! JSON extraction and shape checks for structured agent replies.

use serde_json::{json, Value};

/// Error tag carried by the payload returned after validation gives up.
pub const FAILED_JSON_VALIDATION: &str = "failed_json_validation";

/// Pull the JSON object out of a reply that may be wrapped in a markdown
/// fence or surrounded by prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // ```json ... ```
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // ``` ... ```
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Outermost braces
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}

/// Parse `text` as a JSON object, or explain why it is not one.
pub fn parse_object(text: &str) -> Result<Value, Vec<String>> {
    match serde_json::from_str::<Value>(extract_json(text)) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(vec!["response is not a JSON object".to_string()]),
        Err(e) => Err(vec![format!("response is not valid JSON: {e}")]),
    }
}

fn expect_array(value: &Value, key: &str, errors: &mut Vec<String>) {
    if let Some(v) = value.get(key) {
        if !v.is_array() && !v.is_null() {
            errors.push(format!("\"{key}\" must be an array"));
        }
    }
}

fn expect_state_updates(value: &Value, errors: &mut Vec<String>) {
    let Some(updates) = value.get("stateUpdates") else {
        return;
    };
    match updates {
        Value::Null => {}
        Value::Object(per_character) => {
            for (name, fields) in per_character {
                if !fields.is_object() {
                    errors.push(format!("\"stateUpdates.{name}\" must be an object"));
                }
            }
        }
        _ => errors.push("\"stateUpdates\" must be an object".to_string()),
    }
}

/// Problems with a Director reply; empty when it is usable.
pub fn validate_director(value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    expect_array(value, "actors", &mut errors);
    expect_array(value, "activate", &mut errors);
    expect_array(value, "deactivate", &mut errors);
    expect_state_updates(value, &mut errors);

    if let Some(Value::Array(actors)) = value.get("actors") {
        for (i, actor) in actors.iter().enumerate() {
            let named = match actor {
                Value::String(name) => !name.trim().is_empty(),
                Value::Object(fields) => fields
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| !name.trim().is_empty()),
                _ => false,
            };
            if !named {
                errors.push(format!("\"actors[{i}]\" needs a name"));
            }
        }
    }
    errors
}

/// Problems with a World reply; empty when it is usable.
pub fn validate_world(value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    expect_state_updates(value, &mut errors);
    errors
}

/// The payload returned once retries are exhausted.
pub fn failed_validation(errors: &[String]) -> Value {
    json!({
        "error": FAILED_JSON_VALIDATION,
        "errors": errors,
    })
}

pub fn is_failed_validation(value: &Value) -> bool {
    value.get("error").and_then(Value::as_str) == Some(FAILED_JSON_VALIDATION)
}
