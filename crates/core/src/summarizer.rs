//! Summarizer trait — background history compression.
//!
//! Called fire-and-forget by the summarization trigger; the implementation
//! is expected to persist its result via [`crate::store::ThreadStore::save_summary`]
//! so the *next* turn picks it up. The scheduling turn never awaits it.

use crate::error::ProviderError;
use crate::message::ThreadId;
use async_trait::async_trait;

/// Compresses thread history into a rolling summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce (and persist) a fresh summary for the thread.
    ///
    /// `existing` is the current summary, if any, so implementations can
    /// fold new history into it rather than re-summarizing from scratch.
    async fn summarize(
        &self,
        thread: &ThreadId,
        existing: Option<String>,
    ) -> Result<String, ProviderError>;
}
