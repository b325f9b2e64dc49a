//! Priority context model and the greedy trimmer.
//!
//! `trim` is a priority-ordered greedy bin-pack, **not** an optimal
//! knapsack. The contract is "highest-priority content is never sacrificed
//! for lower-priority content", not "maximum total content retained".

use crate::token;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Ordered priority levels; lower is kept first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    /// Platform directives and system framing.
    SystemInfo = 0,
    /// The live user message.
    CurrentUserMessage = 1,
    /// Protected recent turns.
    RecentConversation = 2,
    /// The rolling conversation summary.
    ConversationSummary = 3,
    /// Retrieval snippets at or above the relevance threshold.
    HighRelevanceKnowledge = 4,
    /// Integration metadata and other mid-value context.
    MediumRelevance = 5,
    /// Retrieval snippets below the relevance threshold.
    LowRelevanceKnowledge = 6,
    /// Timestamps and other clock-dependent content.
    ///
    /// Last so the model-side prefix cache survives a moving clock.
    DynamicInfo = 7,
}

/// One candidate piece of context for a single turn.
///
/// Created per turn by callers of the assembler and discarded once the
/// merged block is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    /// Caller-assigned identifier, for logging and tests.
    pub id: String,

    /// Which tier this item competes in.
    pub tier: PriorityTier,

    /// The rendered text for this item.
    pub content: String,

    /// Estimated token cost, derived from the content at construction.
    pub token_cost: usize,

    /// Whether the trimmer may drop this item.
    pub trimmable: bool,

    /// Relevance score for intra-tier ordering (retrieval snippets).
    pub relevance_score: Option<f32>,

    /// Section label used when rendering the merged block.
    pub section_label: String,
}

impl ContextItem {
    /// Create a trimmable item; token cost is derived from the content.
    pub fn new(
        id: impl Into<String>,
        tier: PriorityTier,
        section_label: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let token_cost = token::estimate_tokens(&content);
        Self {
            id: id.into(),
            tier,
            content,
            token_cost,
            trimmable: true,
            relevance_score: None,
            section_label: section_label.into(),
        }
    }

    /// Mark this item as exempt from trimming.
    pub fn non_trimmable(mut self) -> Self {
        self.trimmable = false;
        self
    }

    /// Attach a relevance score for intra-tier ordering.
    pub fn with_relevance(mut self, score: f32) -> Self {
        self.relevance_score = Some(score);
        self
    }
}

/// The outcome of a trim pass.
#[derive(Debug, Clone)]
pub struct TrimResult {
    /// Items that fit (or were exempt), in sort order.
    pub kept: Vec<ContextItem>,

    /// Trimmable items that did not fit, in sort order.
    pub trimmed: Vec<ContextItem>,

    /// Total token cost of `kept`, including any non-trimmable overflow.
    pub total_tokens: usize,

    /// Whether anything was trimmed.
    pub was_trimmed: bool,
}

/// Select which prioritized items fit a token budget.
///
/// Stable-sorts by `(tier ascending, relevance descending)` and walks the
/// sorted list. Non-trimmable items are always kept and counted, even past
/// the budget — a single warning is the only signal when that happens.
/// Among trimmable items, `sum(kept.token_cost) <= budget` holds.
pub fn trim(mut items: Vec<ContextItem>, budget: usize) -> TrimResult {
    items.sort_by(|a, b| {
        a.tier.cmp(&b.tier).then_with(|| {
            let ra = a.relevance_score.unwrap_or(0.0);
            let rb = b.relevance_score.unwrap_or(0.0);
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        })
    });

    let mut kept = Vec::new();
    let mut trimmed = Vec::new();
    let mut total_tokens = 0usize;
    let mut overflowed = false;

    for item in items {
        if !item.trimmable {
            total_tokens += item.token_cost;
            if total_tokens > budget {
                overflowed = true;
            }
            kept.push(item);
        } else if total_tokens + item.token_cost <= budget {
            total_tokens += item.token_cost;
            kept.push(item);
        } else {
            trimmed.push(item);
        }
    }

    if overflowed {
        warn!(
            total_tokens,
            budget, "Non-trimmable context items exceed the token budget"
        );
    }

    let was_trimmed = !trimmed.is_empty();
    TrimResult {
        kept,
        trimmed,
        total_tokens,
        was_trimmed,
    }
}
