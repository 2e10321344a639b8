//! Budget-trimmed context envelopes.

use super::allocation::{Section, TokenAllocation, TokenBudget};
use crate::model::CharacterState;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Memories retrieved under one key (a participant label, or `"This round"`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryGroup {
    pub key: String,
    pub entries: Vec<String>,
}

impl MemoryGroup {
    pub fn new(key: impl Into<String>, entries: Vec<String>) -> Self {
        Self {
            key: key.into(),
            entries,
        }
    }
}

/// Raw material for one envelope, before trimming.
#[derive(Debug, Clone, Default)]
pub struct ContextSources {
    /// Attributed scene lines, newest first.
    pub history: Vec<String>,
    pub summaries: Vec<String>,
    pub lore: Vec<String>,
    /// Memory groups in priority order.
    pub memories: Vec<MemoryGroup>,
    pub scenario_notes: Vec<String>,
    pub director_guidance: Option<String>,
    pub character_guidance: Option<String>,
    pub character_summaries: Vec<String>,
    pub persona_summary: Option<String>,
    pub state_snapshots: BTreeMap<String, CharacterState>,
}

impl ContextSources {
    fn presence(&self) -> BTreeMap<Section, bool> {
        let has_text = |s: &Option<String>| s.as_deref().is_some_and(|t| !t.trim().is_empty());
        BTreeMap::from([
            (Section::History, !self.history.is_empty()),
            (Section::Summaries, !self.summaries.is_empty()),
            (Section::Lore, !self.lore.is_empty()),
            (
                Section::Memories,
                self.memories.iter().any(|g| !g.entries.is_empty()),
            ),
            (Section::ScenarioNotes, !self.scenario_notes.is_empty()),
            (Section::DirectorGuidance, has_text(&self.director_guidance)),
            (Section::CharacterGuidance, has_text(&self.character_guidance)),
        ])
    }
}

/// Turns [`ContextSources`] into a [`ContextEnvelope`] under a [`TokenBudget`].
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    budget: TokenBudget,
}

impl ContextBuilder {
    pub fn new(budget: TokenBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn build(&self, sources: ContextSources) -> ContextEnvelope {
        let allocation = self.budget.allocate(&sources.presence());
        let budget = &self.budget;
        let ordered = |section: Section, items: Vec<String>| {
            trim_ordered(
                items,
                allocation.cap(section),
                budget.top_k(section),
                budget.allows_empty(section),
            )
        };

        // Trimmed newest-first, stored oldest-first.
        let mut history = ordered(Section::History, sources.history);
        history.reverse();
        let summaries = ordered(Section::Summaries, sources.summaries);
        let lore = ordered(Section::Lore, sources.lore);
        let scenario_notes = ordered(Section::ScenarioNotes, sources.scenario_notes);

        let memories = trim_memories(
            sources.memories,
            allocation.cap(Section::Memories),
            budget.top_k(Section::Memories),
        );

        let director_guidance = trim_text(
            sources.director_guidance,
            allocation.cap(Section::DirectorGuidance),
            budget.allows_empty(Section::DirectorGuidance),
        );
        let character_guidance = trim_text(
            sources.character_guidance,
            allocation.cap(Section::CharacterGuidance),
            budget.allows_empty(Section::CharacterGuidance),
        );

        debug!(
            history = history.len(),
            summaries = summaries.len(),
            lore = lore.len(),
            memory_groups = memories.len(),
            "Built context envelope"
        );

        ContextEnvelope {
            history,
            summaries,
            lore,
            memories,
            scenario_notes,
            director_guidance,
            character_guidance,
            character_summaries: sources.character_summaries,
            persona_summary: sources.persona_summary,
            state_snapshots: sources.state_snapshots,
            allocation,
            director_pass: 1,
            round_responses: Vec::new(),
        }
    }
}

/// Everything one agent call sees. Immutable once built; the `with_*`
/// methods return modified copies.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEnvelope {
    history: Vec<String>,
    summaries: Vec<String>,
    lore: Vec<String>,
    memories: Vec<MemoryGroup>,
    scenario_notes: Vec<String>,
    director_guidance: Option<String>,
    character_guidance: Option<String>,
    character_summaries: Vec<String>,
    persona_summary: Option<String>,
    state_snapshots: BTreeMap<String, CharacterState>,
    allocation: TokenAllocation,
    director_pass: u8,
    round_responses: Vec<String>,
}

impl ContextEnvelope {
    /// Surviving history lines, oldest first.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn summaries(&self) -> &[String] {
        &self.summaries
    }

    pub fn lore(&self) -> &[String] {
        &self.lore
    }

    pub fn memories(&self) -> &[MemoryGroup] {
        &self.memories
    }

    pub fn memory_group(&self, key: &str) -> Option<&MemoryGroup> {
        self.memories.iter().find(|g| g.key == key)
    }

    pub fn scenario_notes(&self) -> &[String] {
        &self.scenario_notes
    }

    pub fn director_guidance(&self) -> Option<&str> {
        self.director_guidance.as_deref()
    }

    pub fn character_guidance(&self) -> Option<&str> {
        self.character_guidance.as_deref()
    }

    pub fn character_summaries(&self) -> &[String] {
        &self.character_summaries
    }

    pub fn persona_summary(&self) -> Option<&str> {
        self.persona_summary.as_deref()
    }

    pub fn state_snapshots(&self) -> &BTreeMap<String, CharacterState> {
        &self.state_snapshots
    }

    pub fn allocation(&self) -> &TokenAllocation {
        &self.allocation
    }

    pub fn director_pass(&self) -> u8 {
        self.director_pass
    }

    pub fn round_responses(&self) -> &[String] {
        &self.round_responses
    }

    /// Whether any text section contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        let in_list = |items: &[String]| items.iter().any(|s| s.contains(needle));
        in_list(&self.history)
            || in_list(&self.summaries)
            || in_list(&self.lore)
            || in_list(&self.scenario_notes)
            || in_list(&self.round_responses)
            || self.memories.iter().any(|g| in_list(&g.entries))
            || self.director_guidance.as_deref().is_some_and(|g| g.contains(needle))
            || self.character_guidance.as_deref().is_some_and(|g| g.contains(needle))
    }

    pub fn without_director_guidance(mut self) -> Self {
        self.director_guidance = None;
        self
    }

    pub fn with_director_pass(mut self, pass: u8) -> Self {
        self.director_pass = pass;
        self
    }

    pub fn with_round_responses(mut self, responses: Vec<String>) -> Self {
        self.round_responses = responses;
        self
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Keep items front to back while they fit in `cap` characters.
///
/// A non-empty source keeps its first item even when it alone overflows,
/// unless `allow_empty` is set.
pub fn trim_ordered(
    items: Vec<String>,
    cap: usize,
    top_k: Option<usize>,
    allow_empty: bool,
) -> Vec<String> {
    let limit = top_k.unwrap_or(usize::MAX);
    let mut kept = Vec::new();
    let mut used = 0;
    let mut first = None;

    for item in items.into_iter().take(limit) {
        let len = char_len(&item);
        if used + len > cap {
            if kept.is_empty() {
                first = Some(item);
            }
            break;
        }
        used += len;
        kept.push(item);
    }

    if kept.is_empty() && !allow_empty {
        if let Some(item) = first {
            kept.push(item);
        }
    }
    kept
}

/// Cut a single text value to `cap` characters on a char boundary.
pub fn trim_text(text: Option<String>, cap: usize, allow_empty: bool) -> Option<String> {
    let text = text.filter(|t| !t.trim().is_empty())?;
    if char_len(&text) <= cap {
        return Some(text);
    }
    let cut: String = text.chars().take(cap).collect();
    if cut.is_empty() {
        if allow_empty {
            None
        } else {
            Some(text)
        }
    } else {
        Some(cut)
    }
}

/// Apply the per-key top-K slice, then share `cap` characters across groups
/// in order. Entries that do not fit are skipped; later, shorter entries may
/// still fit. Groups left empty are dropped.
pub fn trim_memories(groups: Vec<MemoryGroup>, cap: usize, top_k: Option<usize>) -> Vec<MemoryGroup> {
    let limit = top_k.unwrap_or(usize::MAX);
    let mut used = 0;

    groups
        .into_iter()
        .filter_map(|group| {
            let mut entries = Vec::new();
            for entry in group.entries.into_iter().take(limit) {
                let len = char_len(&entry);
                if used + len <= cap {
                    used += len;
                    entries.push(entry);
                }
            }
            (!entries.is_empty()).then(|| MemoryGroup::new(group.key, entries))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SectionCap;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_trim_ordered_stops_at_first_overflow() {
        let kept = trim_ordered(lines(&["aaaa", "bbbb", "cc", "d"]), 9, None, false);
        assert_eq!(kept, lines(&["aaaa", "bbbb"]));
    }

    #[test]
    fn test_trim_ordered_keeps_first_item() {
        let kept = trim_ordered(lines(&["a very long first line"]), 3, None, false);
        assert_eq!(kept, lines(&["a very long first line"]));
    }

    #[test]
    fn test_trim_ordered_may_empty_when_allowed() {
        let kept = trim_ordered(lines(&["a very long first line"]), 3, None, true);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_trim_ordered_respects_top_k() {
        let kept = trim_ordered(lines(&["a", "b", "c"]), 100, Some(2), false);
        assert_eq!(kept, lines(&["a", "b"]));
    }

    #[test]
    fn test_trim_text_char_boundary() {
        let cut = trim_text(Some("héllo wörld".to_string()), 4, false);
        assert_eq!(cut.as_deref(), Some("héll"));
        assert_eq!(trim_text(Some("   ".to_string()), 10, false), None);
    }

    #[test]
    fn test_trim_memories_top_k_then_budget() {
        let groups = vec![
            MemoryGroup::new("This round", lines(&["Alice: Hi!", "x", "y"])),
            MemoryGroup::new("Bob", lines(&["0123456789", "abc"])),
        ];
        let trimmed = trim_memories(groups, 14, Some(2));

        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].entries, lines(&["Alice: Hi!", "x"]));
        // "0123456789" no longer fits; "abc" does.
        assert_eq!(trimmed[1].entries, lines(&["abc"]));
    }

    #[test]
    fn test_history_keeps_newest_and_reads_oldest_first() {
        let builder = ContextBuilder::new(
            TokenBudget::new(1000).with_cap(Section::History, SectionCap::max_chars(12)),
        );
        let envelope = builder.build(ContextSources {
            history: lines(&["Bob: third", "Alice: second", "Nia: first"]),
            ..ContextSources::default()
        });

        // Only the newest line fits.
        assert_eq!(envelope.history(), lines(&["Bob: third"]).as_slice());
    }

    #[test]
    fn test_history_chronological_order() {
        let builder = ContextBuilder::new(TokenBudget::new(1000));
        let envelope = builder.build(ContextSources {
            history: lines(&["Bob: third", "Alice: second", "Nia: first"]),
            ..ContextSources::default()
        });
        assert_eq!(
            envelope.history(),
            lines(&["Nia: first", "Alice: second", "Bob: third"]).as_slice()
        );
    }

    #[test]
    fn test_scenario_notes_may_vanish() {
        let builder = ContextBuilder::new(
            TokenBudget::new(1000).with_cap(Section::ScenarioNotes, SectionCap::max_chars(2)),
        );
        let envelope = builder.build(ContextSources {
            scenario_notes: lines(&["The storm has not broken yet."]),
            ..ContextSources::default()
        });
        assert!(envelope.scenario_notes().is_empty());
    }

    #[test]
    fn test_derived_copies_leave_original_untouched() {
        let builder = ContextBuilder::default();
        let envelope = builder.build(ContextSources {
            director_guidance: Some("Raise the stakes".to_string()),
            ..ContextSources::default()
        });

        let second = envelope
            .clone()
            .without_director_guidance()
            .with_director_pass(2)
            .with_round_responses(lines(&["Alice: Hi!"]));

        assert_eq!(envelope.director_guidance(), Some("Raise the stakes"));
        assert_eq!(envelope.director_pass(), 1);
        assert_eq!(second.director_guidance(), None);
        assert_eq!(second.director_pass(), 2);
        assert!(second.contains("Alice: Hi!"));
        assert!(!envelope.contains("Alice: Hi!"));
    }

    #[test]
    fn test_allocation_record_reflects_presence() {
        let envelope = ContextBuilder::new(TokenBudget::new(100)).build(ContextSources {
            lore: lines(&["The Vale is cold."]),
            ..ContextSources::default()
        });
        assert_eq!(envelope.allocation().cap(Section::History), 0);
        assert!((399..=400).contains(&envelope.allocation().cap(Section::Lore)));
    }
}
