//! Summarization trigger — threshold monitor for background compression.
//!
//! A pure threshold check plus a fire-and-forget spawn. The freshly
//! computed summary is never awaited by the turn that scheduled it; the
//! trigger always returns the *existing* (possibly stale) summary, so this
//! call adds no latency to the current turn and only improves context
//! quality for the next one. The spawned summarizer persists its result
//! through the thread store on its own.

use opsdesk_config::BudgetConfig;
use opsdesk_core::message::ThreadId;
use opsdesk_core::store::SummaryState;
use opsdesk_core::summarizer::Summarizer;
use std::sync::Arc;
use tracing::{debug, warn};

/// Schedules background summarization when context usage crosses the
/// configured threshold.
pub struct SummarizationTrigger {
    summarizer: Arc<dyn Summarizer>,
}

impl SummarizationTrigger {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }

    /// Check usage and maybe schedule a background summarization job.
    ///
    /// Returns the existing summary unchanged in every case. Idempotent to
    /// call repeatedly within a turn; no duplicate-scheduling guard exists
    /// at this layer, so repeated above-threshold calls spawn repeated jobs
    /// (the summarizer implementation may coalesce).
    pub fn check(
        &self,
        thread: &ThreadId,
        state: &SummaryState,
        total_tokens: usize,
        config: &BudgetConfig,
    ) -> Option<String> {
        let existing = state.existing_summary.clone();

        if !config.summarization_enabled {
            return existing;
        }

        let usage_ratio = total_tokens as f32 / config.model_context_limit as f32;
        if usage_ratio < config.summarization_threshold {
            return existing;
        }

        debug!(
            thread = %thread,
            usage_ratio,
            threshold = config.summarization_threshold,
            "Scheduling background summarization"
        );

        let summarizer = Arc::clone(&self.summarizer);
        let thread = thread.clone();
        let seed = existing.clone();
        tokio::spawn(async move {
            match summarizer.summarize(&thread, seed).await {
                Ok(_) => debug!(thread = %thread, "Background summarization completed"),
                Err(e) => warn!(thread = %thread, error = %e, "Background summarization failed"),
            }
        });

        existing
    }
}
