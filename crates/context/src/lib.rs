//! Context budget engine — the core of the Opsdesk turn pipeline.
//!
//! Decides exactly what information (dialogue history, retrieved knowledge,
//! summaries, integration metadata, system directives) reaches the model on
//! each turn, under a hard token ceiling, in a deterministic structure.
//!
//! # Priority Tiers (kept-first order)
//!
//! | Tier | Content | Trimmable |
//! |------|---------|-----------|
//! | 0. SystemInfo | platform directives | never |
//! | 1. CurrentUserMessage | the live prompt | never |
//! | 2. RecentConversation | protected recent turns | never |
//! | 3. ConversationSummary | rolling summary | yes |
//! | 4. HighRelevanceKnowledge | retrieval ≥ 70% | yes |
//! | 5. MediumRelevance | integration metadata etc. | yes |
//! | 6. LowRelevanceKnowledge | retrieval < 70% | yes |
//! | 7. DynamicInfo | timestamps, rendered last | never |
//!
//! Timestamps come last so identical-prefix caching on the model side is
//! not invalidated by a moving clock.

pub mod assembler;
pub mod history;
pub mod priority;
pub mod reorder;
pub mod token;

pub use assembler::{AssemblerInput, ContextAssembler, ContextStats, MergedContext};
pub use history::{filter_history, FilteredHistory};
pub use priority::{trim, ContextItem, PriorityTier, TrimResult};
pub use reorder::{reorder_groups, MessageGroups};
