//! Director plans.
//!
//! The Director replies with loosely structured JSON. [`DirectorPlan`] is its
//! normalized form: a sorted actor list, activation changes and state
//! updates with `"default"` placeholders removed.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::warn;

use crate::model::{CharacterState, Participant};

/// State value meaning "leave this field alone".
pub const DEFAULT_SENTINEL: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedActor {
    pub name: String,
    pub order: Option<f64>,
    pub priority: Option<f64>,
    /// Note for this actor only.
    pub guidance: Option<String>,
}

impl PlannedActor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: None,
            priority: None,
            guidance: None,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) if !name.trim().is_empty() => Some(Self::named(name.trim())),
            Value::Object(fields) => {
                let name = fields.get("name")?.as_str()?.trim();
                if name.is_empty() {
                    return None;
                }
                Some(Self {
                    name: name.to_string(),
                    order: fields.get("order").and_then(number),
                    priority: fields.get("priority").and_then(number),
                    guidance: fields
                        .get("guidance")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|g| !g.is_empty())
                        .map(str::to_string),
                })
            }
            _ => None,
        }
    }
}

/// Accept `2` and `"2"` alike.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare_optional(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Ascending by `order`, then `priority`, then name. Missing values sort last.
pub fn compare_actors(a: &PlannedActor, b: &PlannedActor) -> Ordering {
    compare_optional(a.order, b.order)
        .then_with(|| compare_optional(a.priority, b.priority))
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
}

fn names(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(fields) => fields.get("name")?.as_str().map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn is_sentinel(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.trim().eq_ignore_ascii_case(DEFAULT_SENTINEL))
}

/// Per-character updates from a `stateUpdates` object, dropping sentinel
/// values and characters left with nothing to change.
pub fn parse_state_updates(value: Option<&Value>) -> BTreeMap<String, CharacterState> {
    let Some(Value::Object(per_character)) = value else {
        return BTreeMap::new();
    };
    per_character
        .iter()
        .filter_map(|(name, fields)| {
            let fields = fields.as_object()?;
            let state: CharacterState = fields
                .iter()
                .filter(|(_, v)| !is_sentinel(v) && !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (!state.is_empty()).then(|| (name.clone(), state))
        })
        .collect()
}

fn state_updates_field(value: &Value) -> Option<&Value> {
    value.get("stateUpdates").or_else(|| value.get("state_updates"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectorPlan {
    /// Acting order, already sorted.
    pub actors: Vec<PlannedActor>,
    pub activate: Vec<String>,
    pub deactivate: Vec<String>,
    pub state_updates: BTreeMap<String, CharacterState>,
    /// Note for the whole round.
    pub guidance: Option<String>,
}

impl DirectorPlan {
    /// Normalize a Director reply. Anything unrecognized is ignored.
    pub fn from_value(value: &Value) -> Self {
        let mut actors: Vec<PlannedActor> = match value.get("actors") {
            Some(Value::Array(items)) => items.iter().filter_map(PlannedActor::from_value).collect(),
            _ => Vec::new(),
        };
        actors.sort_by(compare_actors);

        let mut seen = Vec::<String>::new();
        actors.retain(|a| {
            let key = a.name.to_lowercase();
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });

        Self {
            actors,
            activate: names(value.get("activate")),
            deactivate: names(value.get("deactivate")),
            state_updates: parse_state_updates(state_updates_field(value)),
            guidance: value
                .get("guidance")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string),
        }
    }

    pub fn actor(&self, name: &str) -> Option<&PlannedActor> {
        self.actors.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Map the planned actors onto `active` participants. Unknown names are
    /// skipped. With no usable actors, everyone in `active` acts, by name.
    pub fn acting_order(&self, active: &[Participant]) -> Vec<Participant> {
        let mut order = Vec::new();
        for actor in &self.actors {
            match active.iter().find(|p| p.name.eq_ignore_ascii_case(&actor.name)) {
                Some(p) => order.push(p.clone()),
                None => warn!(actor = %actor.name, "Director chose an inactive participant"),
            }
        }
        if order.is_empty() {
            order = active.to_vec();
            order.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        }
        order
    }
}
