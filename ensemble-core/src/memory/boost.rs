//! Rule-based score boosting.

use serde_json::Value;

use super::{lookup_path, MemoryMetadata};
use crate::config::{ConditionalRule, MatchType};

/// Whether `rule` matches the metadata value at its field path.
///
/// Comparison is case-insensitive. Arrays match when any element does;
/// missing fields, nulls and objects never match.
pub fn rule_matches(rule: &ConditionalRule, metadata: &Value) -> bool {
    let path = rule.field.strip_prefix("metadata.").unwrap_or(&rule.field);
    let Some(value) = lookup_path(metadata, path) else {
        return false;
    };
    let pattern = rule.pattern.to_lowercase();
    value_matches(value, &pattern, rule.match_type)
}

fn value_matches(value: &Value, pattern: &str, match_type: MatchType) -> bool {
    let text = match value {
        Value::String(s) => s.to_lowercase(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => {
            return items
                .iter()
                .any(|item| value_matches(item, pattern, match_type))
        }
        Value::Null | Value::Object(_) => return false,
    };
    match match_type {
        MatchType::Substring => text.contains(pattern),
        MatchType::Exact => text == pattern,
    }
}

/// Product of the boosts of every matching rule (1.0 when none match).
pub fn boost_factor(rules: &[ConditionalRule], metadata: &MemoryMetadata) -> f32 {
    if rules.is_empty() {
        return 1.0;
    }
    let value = metadata.to_value();
    rules
        .iter()
        .filter(|rule| rule_matches(rule, &value))
        .map(|rule| rule.boost)
        .product()
}

pub fn apply_boosts(score: f32, rules: &[ConditionalRule], metadata: &MemoryMetadata) -> f32 {
    score * boost_factor(rules, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> MemoryMetadata {
        serde_json::from_value(json!({
            "characterName": "Alice Marsh",
            "sceneId": 4,
            "actors": ["Alice Marsh", "Bob"],
            "location": "Harbor Docks"
        }))
        .unwrap()
    }

    #[test]
    fn test_substring_is_case_insensitive() {
        let rule = ConditionalRule::substring("characterName", "ALICE", 2.0);
        assert_eq!(boost_factor(&[rule], &metadata()), 2.0);
    }

    #[test]
    fn test_exact_needs_whole_value() {
        let partial = ConditionalRule::exact("characterName", "alice", 2.0);
        let whole = ConditionalRule::exact("characterName", "alice marsh", 3.0);
        assert_eq!(boost_factor(&[partial], &metadata()), 1.0);
        assert_eq!(boost_factor(&[whole], &metadata()), 3.0);
    }

    #[test]
    fn test_rules_compose_multiplicatively() {
        let rules = vec![
            ConditionalRule::substring("characterName", "alice", 2.0),
            ConditionalRule::substring("metadata.location", "docks", 1.5),
            ConditionalRule::exact("sceneId", "4", 0.5),
        ];
        let score = apply_boosts(0.8, &rules, &metadata());
        assert!((score - 0.8 * 2.0 * 1.5 * 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_fields_are_skipped() {
        let rules = vec![
            ConditionalRule::substring("mood", "angry", 5.0),
            ConditionalRule::substring("location.street", "main", 5.0),
        ];
        assert_eq!(boost_factor(&rules, &metadata()), 1.0);
    }

    #[test]
    fn test_array_fields_match_any_element() {
        let rule = ConditionalRule::exact("actors", "bob", 1.25);
        assert_eq!(boost_factor(&[rule], &metadata()), 1.25);
    }
}
