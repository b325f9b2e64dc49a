//! Message reordering layer — the fixed five-group ordering contract.
//!
//! Model-invocation libraries hand the pipeline message groups in whatever
//! order they were produced (search results, history, injected context,
//! the live message). If injected system context is not first, models treat
//! it as mid-conversation chatter instead of authoritative framing, so this
//! layer imposes:
//!
//! **system/injected context → retrieval results → filtered history →
//! current user message → existing responses**
//!
//! History is re-filtered here with fresh token totals of the other four
//! groups, since their sizes are only known once those groups are final.

use crate::history::filter_history;
use crate::token;
use opsdesk_config::BudgetConfig;
use opsdesk_core::message::ThreadMessage;

/// The five message groups composing one model request.
#[derive(Debug, Clone, Default)]
pub struct MessageGroups {
    /// Injected system context (the merged block and any hook additions).
    pub system_context: Vec<ThreadMessage>,

    /// Model-driven retrieval results arriving as messages.
    pub retrieval_results: Vec<ThreadMessage>,

    /// Thread history (already filtered once at assembly; re-filtered here).
    pub history: Vec<ThreadMessage>,

    /// The live user message.
    pub current: Option<ThreadMessage>,

    /// Responses already produced earlier in a multi-step turn.
    pub existing_responses: Vec<ThreadMessage>,

    /// Tokens inside `system_context` that duplicate the history group
    /// (a rendered history section in an injected context block). Excluded
    /// from the reserve so history is not charged twice.
    pub history_tokens_in_context: usize,
}

/// Flatten the groups into the contract order, re-filtering history
/// against the finalized token totals of the other four groups.
pub fn reorder_groups(groups: MessageGroups, config: &BudgetConfig) -> Vec<ThreadMessage> {
    let mut reserved = token::estimate_messages_tokens(&groups.system_context)
        + token::estimate_messages_tokens(&groups.retrieval_results)
        + token::estimate_messages_tokens(&groups.existing_responses);
    if let Some(current) = &groups.current {
        reserved += token::estimate_message_tokens(current);
    }
    // An injected block that renders history would otherwise charge that
    // history against itself.
    reserved = reserved.saturating_sub(groups.history_tokens_in_context);

    let filtered = filter_history(&groups.history, reserved, config);

    let mut out = Vec::with_capacity(
        groups.system_context.len()
            + groups.retrieval_results.len()
            + filtered.messages.len()
            + 1
            + groups.existing_responses.len(),
    );
    out.extend(groups.system_context);
    out.extend(groups.retrieval_results);
    out.extend(filtered.messages);
    if let Some(current) = groups.current {
        out.push(current);
    }
    out.extend(groups.existing_responses);
    out
}
