//! Input normalization at the engine boundary.
//!
//! Clients sometimes send the user's prompt JSON-encoded, sometimes several
//! times over, sometimes wrapped in `{"prompt": ...}`. [`unwrap_prompt`]
//! peels those layers with fixed depth limits so hostile input cannot make
//! it loop.

use serde_json::Value;

/// Envelope layers (`{"prompt": ...}` or encoded strings) peeled at most.
pub const MAX_OUTER_DEPTH: usize = 8;

/// JSON string decodes attempted per layer.
pub const MAX_INNER_DEPTH: usize = 4;

fn looks_encoded(text: &str) -> bool {
    text.starts_with('{') || text.starts_with('"')
}

/// Decode `text` while it still looks like encoded JSON. Returns `None` when
/// it is already plain text.
fn decode_layers(text: &str) -> Option<Value> {
    let mut current = text.trim().to_string();
    let mut decoded = None;

    for _ in 0..MAX_INNER_DEPTH {
        if !looks_encoded(&current) {
            break;
        }
        match serde_json::from_str::<Value>(&current) {
            Ok(Value::String(inner)) => {
                current = inner.trim().to_string();
                decoded = Some(Value::String(current.clone()));
            }
            Ok(other) => return Some(other),
            Err(_) => break,
        }
    }
    decoded
}

fn render(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Reduce a possibly nested, possibly encoded prompt to its text.
pub fn unwrap_prompt(raw: Value) -> String {
    let mut current = raw;

    for _ in 0..MAX_OUTER_DEPTH {
        current = match current {
            Value::String(text) => match decode_layers(&text) {
                Some(inner) => inner,
                None => return text,
            },
            Value::Object(mut fields) => match fields.remove("prompt") {
                Some(inner) => inner,
                None => return Value::Object(fields).to_string(),
            },
            other => return render(other),
        };
    }
    render(current)
}

/// [`unwrap_prompt`] for raw request text.
pub fn unwrap_prompt_str(raw: &str) -> String {
    unwrap_prompt(Value::String(raw.to_string()))
}
