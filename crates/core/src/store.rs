//! Thread store trait — persistence boundary for conversation threads.
//!
//! The engine reads history and appends messages through this trait; the
//! actual schema lives in the embedding platform. The thread record is the
//! only shared mutable resource in the turn engine, and the engine assumes
//! (without enforcing) that the platform runs at most one turn per thread
//! at a time.

use crate::error::StoreError;
use crate::message::{ThreadId, ThreadMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The summary state persisted per thread between turns.
///
/// Mutated only by the background summarization job, never by the turn
/// that scheduled it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryState {
    /// The most recent completed summary, if any.
    pub existing_summary: Option<String>,

    /// Context usage ratio recorded when the summary was last refreshed.
    pub usage_ratio: f32,
}

/// Persistence boundary for threads.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// List all messages of a thread in increasing `(order, step_order)` order.
    async fn list_messages(&self, thread: &ThreadId) -> Result<Vec<ThreadMessage>, StoreError>;

    /// Append a message to a thread.
    async fn append_message(
        &self,
        thread: &ThreadId,
        message: ThreadMessage,
    ) -> Result<(), StoreError>;

    /// Read the persisted summary state for a thread.
    async fn summary_state(&self, thread: &ThreadId) -> Result<SummaryState, StoreError>;

    /// Persist a freshly computed summary (called by the background job).
    async fn save_summary(&self, thread: &ThreadId, summary: String) -> Result<(), StoreError>;
}
