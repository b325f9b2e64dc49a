//! Retrieval prefetch cache — start the expensive search before any tool
//! asks for it.
//!
//! At turn start, before it is known whether a tool will need retrieval
//! results, the pipeline eagerly spawns the search (expanding the query
//! with recent messages when it looks pronoun-unresolved) and keeps a
//! memoized handle. Whichever consumer needs it first joins the future;
//! later consumers see the same resolved value. A failed or panicked
//! search resolves to the explicit empty outcome, so a down retrieval
//! service degrades the turn instead of failing it.

use futures::future::{BoxFuture, FutureExt, Shared};
use opsdesk_core::message::{Role, ThreadMessage};
use opsdesk_core::retrieval::{RetrievalOutcome, RetrievalService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Query words that usually refer back to something in recent messages.
const UNRESOLVED_REFERENCES: [&str; 7] = ["it", "this", "that", "they", "them", "these", "those"];

/// How many recent messages feed query expansion.
const EXPANSION_MESSAGES: usize = 3;

/// Truncation cap per expansion message, in characters.
const EXPANSION_CHAR_CAP: usize = 200;

/// A single-producer, shareable handle to an in-flight retrieval call.
pub struct RetrievalPrefetch {
    future: Shared<BoxFuture<'static, RetrievalOutcome>>,
    consumed: AtomicBool,
    started_at: Instant,
}

impl RetrievalPrefetch {
    /// Eagerly start the retrieval call in the background.
    pub fn start(
        retrieval: Arc<dyn RetrievalService>,
        query: &str,
        recent_messages: &[ThreadMessage],
    ) -> Self {
        let expanded = expand_query(query, recent_messages);
        if expanded.len() > query.len() {
            debug!("Prefetch query expanded with recent conversation context");
        }

        let handle = tokio::spawn(async move {
            match retrieval.search(&expanded).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Prefetched retrieval failed, degrading to empty outcome");
                    RetrievalOutcome::empty()
                }
            }
        });

        let future = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Prefetch task join failed");
                    RetrievalOutcome::empty()
                }
            }
        }
        .boxed()
        .shared();

        Self {
            future,
            consumed: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// Await the retrieval outcome. Safe to call from multiple consumers;
    /// all see the same resolved value.
    pub async fn get(&self) -> RetrievalOutcome {
        self.future.clone().await
    }

    /// Mark the cache consumed; returns `true` for the first caller only.
    ///
    /// Reads are NOT exclusive — this exists so telemetry can tell whether
    /// (and by whom) the prefetched result was first used.
    pub fn claim(&self) -> bool {
        !self.consumed.swap(true, Ordering::SeqCst)
    }

    /// Whether any consumer has claimed the cache.
    pub fn consumed(&self) -> bool {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Time since the background call was started.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Whether a query contains an unresolved back-reference worth expanding.
fn needs_expansion(query: &str) -> bool {
    query
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| UNRESOLVED_REFERENCES.contains(&word.to_lowercase().as_str()))
}

/// Append recent user/assistant content to a pronoun-heavy query so the
/// retrieval service sees what "it" refers to.
fn expand_query(query: &str, recent: &[ThreadMessage]) -> String {
    if !needs_expansion(query) || recent.is_empty() {
        return query.to_string();
    }

    let context: Vec<String> = recent
        .iter()
        .rev()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .take(EXPANSION_MESSAGES)
        .map(|m| {
            let mut text: String = m.content.chars().take(EXPANSION_CHAR_CAP).collect();
            if m.content.chars().count() > EXPANSION_CHAR_CAP {
                text.push('…');
            }
            text
        })
        .collect();

    if context.is_empty() {
        return query.to_string();
    }

    // Oldest first, so the expansion reads chronologically.
    let mut context = context;
    context.reverse();
    format!("{query}\n\nRecent context:\n{}", context.join("\n"))
}
