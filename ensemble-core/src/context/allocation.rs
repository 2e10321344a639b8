//! Token budget allocation across context sections.
//!
//! A budget assigns each section a fraction of `maxContextTokens`. Sections
//! with no content give their fraction back, and it is shared out to the
//! present sections in proportion to what they already hold. The resolved
//! fractions become character caps through a chars-per-token multiplier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default ceiling on assembled context, in tokens.
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 8192;

/// Conservative characters-per-token estimate used to turn token fractions
/// into character caps. Tunable through [`TokenBudget::chars_per_token`].
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// A named part of a context envelope that competes for budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Section {
    History,
    Summaries,
    Lore,
    Memories,
    ScenarioNotes,
    DirectorGuidance,
    CharacterGuidance,
}

impl Section {
    pub const ALL: [Section; 7] = [
        Section::History,
        Section::Summaries,
        Section::Lore,
        Section::Memories,
        Section::ScenarioNotes,
        Section::DirectorGuidance,
        Section::CharacterGuidance,
    ];

    /// The config key for this section.
    pub fn key(&self) -> &'static str {
        match self {
            Section::History => "history",
            Section::Summaries => "summaries",
            Section::Lore => "lore",
            Section::Memories => "memories",
            Section::ScenarioNotes => "scenarioNotes",
            Section::DirectorGuidance => "directorGuidance",
            Section::CharacterGuidance => "characterGuidance",
        }
    }

    pub fn default_fraction(&self) -> f64 {
        match self {
            Section::History => 0.30,
            Section::Summaries => 0.10,
            Section::Lore => 0.15,
            Section::Memories => 0.20,
            Section::ScenarioNotes => 0.10,
            Section::DirectorGuidance => 0.05,
            Section::CharacterGuidance => 0.10,
        }
    }

    /// Whether trimming may leave this section empty by default.
    pub fn allows_empty_by_default(&self) -> bool {
        matches!(self, Section::ScenarioNotes)
    }
}

/// Explicit overrides for one section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SectionCap {
    /// Character cap that replaces the derived one.
    pub max_chars: Option<usize>,
    /// Keep at most this many items (per key, for memories).
    pub top_k: Option<usize>,
    /// Allow trimming to drop every item.
    pub allow_empty_on_cap: Option<bool>,
}

impl SectionCap {
    pub fn max_chars(max_chars: usize) -> Self {
        Self {
            max_chars: Some(max_chars),
            ..Self::default()
        }
    }

    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k: Some(top_k),
            ..Self::default()
        }
    }

    pub fn allowing_empty(mut self) -> Self {
        self.allow_empty_on_cap = Some(true);
        self
    }
}

/// Caller-facing budget description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenBudget {
    pub max_context_tokens: usize,
    pub chars_per_token: f64,
    /// Fractions merged over the defaults.
    pub allocations: BTreeMap<Section, f64>,
    pub caps: BTreeMap<Section, SectionCap>,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            allocations: BTreeMap::new(),
            caps: BTreeMap::new(),
        }
    }
}

impl TokenBudget {
    pub fn new(max_context_tokens: usize) -> Self {
        Self {
            max_context_tokens,
            ..Self::default()
        }
    }

    pub fn with_allocation(mut self, section: Section, fraction: f64) -> Self {
        self.allocations.insert(section, fraction);
        self
    }

    pub fn with_cap(mut self, section: Section, cap: SectionCap) -> Self {
        self.caps.insert(section, cap);
        self
    }

    pub fn with_chars_per_token(mut self, chars_per_token: f64) -> Self {
        self.chars_per_token = chars_per_token;
        self
    }

    pub fn allows_empty(&self, section: Section) -> bool {
        self.caps
            .get(&section)
            .and_then(|c| c.allow_empty_on_cap)
            .unwrap_or_else(|| section.allows_empty_by_default())
    }

    pub fn top_k(&self, section: Section) -> Option<usize> {
        self.caps.get(&section).and_then(|c| c.top_k)
    }

    /// Resolve fractions and caps for the given presence map.
    pub fn allocate(&self, presence: &BTreeMap<Section, bool>) -> TokenAllocation {
        let fractions = resolve_fractions(presence, &self.allocations);

        let char_caps = fractions
            .iter()
            .map(|(&section, &fraction)| {
                let derived = derived_cap(self.max_context_tokens, fraction, self.chars_per_token);
                let cap = self
                    .caps
                    .get(&section)
                    .and_then(|c| c.max_chars)
                    .unwrap_or(derived);
                (section, cap)
            })
            .collect();

        TokenAllocation {
            max_context_tokens: self.max_context_tokens,
            fractions,
            char_caps,
        }
    }
}

/// The resolved budget handed back with each envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAllocation {
    pub max_context_tokens: usize,
    pub fractions: BTreeMap<Section, f64>,
    pub char_caps: BTreeMap<Section, usize>,
}

impl TokenAllocation {
    pub fn cap(&self, section: Section) -> usize {
        self.char_caps.get(&section).copied().unwrap_or(0)
    }

    pub fn fraction(&self, section: Section) -> f64 {
        self.fractions.get(&section).copied().unwrap_or(0.0)
    }
}

/// Merge `overrides` over the defaults, then hand the share of every absent
/// section to the present ones in proportion to their own share.
///
/// A section missing from `presence` counts as absent. When no present
/// section holds a positive fraction, absent sections are zeroed and nothing
/// else changes.
pub fn resolve_fractions(
    presence: &BTreeMap<Section, bool>,
    overrides: &BTreeMap<Section, f64>,
) -> BTreeMap<Section, f64> {
    let mut fractions: BTreeMap<Section, f64> = Section::ALL
        .iter()
        .map(|&s| (s, overrides.get(&s).copied().unwrap_or_else(|| s.default_fraction())))
        .collect();

    let is_present = |s: &Section| presence.get(s).copied().unwrap_or(false);

    let freed: f64 = fractions
        .iter()
        .filter(|(s, _)| !is_present(s))
        .map(|(_, f)| *f)
        .sum();
    let denominator: f64 = fractions
        .iter()
        .filter(|(s, f)| is_present(s) && **f > 0.0)
        .map(|(_, f)| *f)
        .sum();

    for (section, fraction) in fractions.iter_mut() {
        if !is_present(section) {
            *fraction = 0.0;
        } else if denominator > 0.0 && *fraction > 0.0 {
            *fraction += freed * (*fraction / denominator);
        }
    }

    fractions
}

/// `floor(max_tokens * fraction * chars_per_token)`.
pub fn derived_cap(max_context_tokens: usize, fraction: f64, chars_per_token: f64) -> usize {
    let raw = max_context_tokens as f64 * fraction * chars_per_token;
    if raw.is_finite() && raw > 0.0 {
        raw.floor() as usize
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(present: &[Section]) -> BTreeMap<Section, bool> {
        Section::ALL
            .iter()
            .map(|s| (*s, present.contains(s)))
            .collect()
    }

    #[test]
    fn test_defaults_sum_to_one() {
        let total: f64 = Section::ALL.iter().map(|s| s.default_fraction()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_present_keeps_defaults() {
        let fractions = resolve_fractions(&presence(&Section::ALL), &BTreeMap::new());
        for section in Section::ALL {
            assert!((fractions[&section] - section.default_fraction()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_absent_sections_redistribute_proportionally() {
        // History (0.30) and summaries (0.10) are empty: 0.40 goes to the rest.
        let present = [
            Section::Lore,
            Section::Memories,
            Section::ScenarioNotes,
            Section::DirectorGuidance,
            Section::CharacterGuidance,
        ];
        let fractions = resolve_fractions(&presence(&present), &BTreeMap::new());

        assert_eq!(fractions[&Section::History], 0.0);
        assert_eq!(fractions[&Section::Summaries], 0.0);

        // Remaining defaults sum to 0.60, so each grows by a factor of 1/0.6.
        assert!((fractions[&Section::Lore] - 0.15 / 0.6).abs() < 1e-9);
        assert!((fractions[&Section::Memories] - 0.20 / 0.6).abs() < 1e-9);
        let total: f64 = fractions.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_sections_get_no_characters() {
        let budget = TokenBudget::new(1000);
        let allocation = budget.allocate(&presence(&[Section::Lore, Section::Memories]));

        assert_eq!(allocation.cap(Section::History), 0);
        assert_eq!(allocation.cap(Section::Summaries), 0);
        // Lore and memories split the whole budget 0.15 : 0.20.
        let lore = allocation.cap(Section::Lore);
        let memories = allocation.cap(Section::Memories);
        assert!(lore + memories <= 4000);
        assert!(lore + memories >= 3998);
        assert!(memories > lore);
    }

    #[test]
    fn test_zero_denominator_only_zeroes_absent() {
        let mut overrides = BTreeMap::new();
        overrides.insert(Section::Lore, 0.0);
        let fractions = resolve_fractions(&presence(&[Section::Lore]), &overrides);

        assert!(fractions.values().all(|f| *f == 0.0));
    }

    #[test]
    fn test_present_section_with_zero_fraction_receives_nothing() {
        let mut overrides = BTreeMap::new();
        overrides.insert(Section::Lore, 0.0);
        let fractions =
            resolve_fractions(&presence(&[Section::Lore, Section::History]), &overrides);

        assert_eq!(fractions[&Section::Lore], 0.0);
        assert!((fractions[&Section::History] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_cap_wins_even_when_smaller() {
        let budget = TokenBudget::new(10_000).with_cap(Section::History, SectionCap::max_chars(50));
        let allocation = budget.allocate(&presence(&Section::ALL));

        assert_eq!(allocation.cap(Section::History), 50);
        assert!((5999..=6000).contains(&allocation.cap(Section::Lore)));
    }

    #[test]
    fn test_explicit_cap_wins_even_when_larger() {
        let budget = TokenBudget::new(10).with_cap(Section::Lore, SectionCap::max_chars(5000));
        let allocation = budget.allocate(&presence(&Section::ALL));
        assert_eq!(allocation.cap(Section::Lore), 5000);
    }

    #[test]
    fn test_derived_cap_floors() {
        assert_eq!(derived_cap(100, 0.333, 4.0), 133);
        assert_eq!(derived_cap(100, 0.0, 4.0), 0);
        assert_eq!(derived_cap(100, 0.5, 3.5), 175);
    }

    #[test]
    fn test_allow_empty_defaults() {
        let budget = TokenBudget::default();
        assert!(budget.allows_empty(Section::ScenarioNotes));
        assert!(!budget.allows_empty(Section::History));

        let budget = budget.with_cap(Section::Lore, SectionCap::default().allowing_empty());
        assert!(budget.allows_empty(Section::Lore));
    }
}
