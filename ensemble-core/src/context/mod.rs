//! Context assembly: token budget allocation and envelope trimming.

mod allocation;
mod builder;

pub use allocation::{
    derived_cap, resolve_fractions, Section, SectionCap, TokenAllocation, TokenBudget,
    DEFAULT_CHARS_PER_TOKEN, DEFAULT_MAX_CONTEXT_TOKENS,
};
pub use builder::{
    trim_memories, trim_ordered, trim_text, ContextBuilder, ContextEnvelope, ContextSources,
    MemoryGroup,
};
