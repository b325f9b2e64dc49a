//! Token-budget-aware selection over chronological conversation history.
//!
//! Walks history newest-to-oldest, keeping a protected window of the most
//! recent messages unconditionally, skipping oversized tool results, and
//! filling whatever budget remains. Output preserves chronological order;
//! persisted history is never mutated.

use crate::token;
use opsdesk_config::BudgetConfig;
use opsdesk_core::message::{Role, ThreadMessage};
use tracing::debug;

/// Share of the *remaining* budget beyond which a tool-result message is
/// skipped outright, so one huge result cannot crowd out many smaller
/// messages that would otherwise fit.
const OVERSIZED_TOOL_FRACTION: f32 = 0.30;

/// Floor applied when reservations already consume the whole budget.
const FLOOR_MESSAGES: usize = 2;

/// The outcome of a history filter pass.
#[derive(Debug, Clone)]
pub struct FilteredHistory {
    /// Selected messages in chronological order.
    pub messages: Vec<ThreadMessage>,

    /// How many messages were skipped.
    pub skipped: usize,
}

/// Select which history messages fit the budget left over after the other
/// context parts have claimed `reserved_tokens`.
pub fn filter_history(
    history: &[ThreadMessage],
    reserved_tokens: usize,
    config: &BudgetConfig,
) -> FilteredHistory {
    let usable = (config.model_context_limit as f32 * config.safety_margin) as usize;
    let budget = usable
        .saturating_sub(reserved_tokens)
        .saturating_sub(config.system_instruction_tokens)
        .saturating_sub(config.output_reserve_tokens);

    if budget == 0 {
        // Reservations ate everything. Keep a bare floor of recency.
        let keep = history.len().min(FLOOR_MESSAGES);
        debug!(
            reserved_tokens,
            "History budget exhausted by reservations, keeping floor of {keep} messages"
        );
        return FilteredHistory {
            messages: history[history.len() - keep..].to_vec(),
            skipped: history.len() - keep,
        };
    }

    let mut selected: Vec<ThreadMessage> = Vec::new();
    let mut remaining = budget;
    let mut skipped = 0usize;

    for (idx, msg) in history.iter().rev().enumerate() {
        let cost = token::estimate_message_tokens(msg);

        // The most recent messages are kept regardless of size.
        if idx < config.min_protected_recent {
            remaining = remaining.saturating_sub(cost);
            selected.push(msg.clone());
            continue;
        }

        // One huge tool result would crowd out many smaller messages even
        // when it technically fits; skip it outright.
        if msg.role == Role::Tool
            && cost as f32 > remaining as f32 * OVERSIZED_TOOL_FRACTION
        {
            debug!(
                message_id = %msg.id,
                cost,
                remaining,
                "Skipping oversized tool result"
            );
            skipped += 1;
            continue;
        }

        if cost <= remaining {
            remaining -= cost;
            selected.push(msg.clone());
        } else {
            skipped += 1;
        }
    }

    // Restore chronological order.
    selected.reverse();

    FilteredHistory {
        messages: selected,
        skipped,
    }
}
