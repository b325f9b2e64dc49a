//! Retrieval service trait — the external knowledge-base search collaborator.
//!
//! The ranking algorithm behind this trait is out of scope; the engine only
//! consumes its output: a text block of relevance-scored snippets in the
//! upstream `"[n] (Relevance: XX%)"` convention, which the assembler splits
//! into primary/secondary knowledge sections.

use crate::error::RetrievalError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The outcome of a retrieval call.
///
/// A failed call is represented as an unsuccessful-but-valid outcome so a
/// down retrieval service degrades the turn instead of failing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    /// Scored snippets as one text block, e.g.
    /// `"[1] (Relevance: 85.0%)\nFact A\n\n---\n\n[2] (Relevance: 40.0%)\nFact B"`.
    /// Empty when nothing was found or the call failed.
    pub snippet_text: String,

    /// Whether the retrieval call itself succeeded.
    pub successful: bool,
}

impl RetrievalOutcome {
    /// The explicit degraded outcome used when retrieval fails.
    pub fn empty() -> Self {
        Self {
            snippet_text: String::new(),
            successful: false,
        }
    }

    /// A successful outcome carrying snippet text.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            snippet_text: text.into(),
            successful: true,
        }
    }

    /// True when there is usable snippet text.
    pub fn has_content(&self) -> bool {
        self.successful && !self.snippet_text.is_empty()
    }
}

/// The external knowledge-base search collaborator.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Search the knowledge base for snippets relevant to `query`.
    async fn search(&self, query: &str) -> Result<RetrievalOutcome, RetrievalError>;
}
