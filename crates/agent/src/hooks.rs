//! Hook interface — per-agent customization of the shared pipeline.
//!
//! A typed strategy object injected at pipeline construction time. Every
//! method has a no-op default, so an agent implements only what it needs:
//! the CRM agent injects record metadata in `before_context`, the workflow
//! agent rewrites the prompt in `before_generate`, and so on.

use crate::prefetch::RetrievalPrefetch;
use crate::turn::{TurnArgs, TurnResult};
use async_trait::async_trait;
use opsdesk_context::MergedContext;
use opsdesk_core::message::ThreadMessage;
use std::sync::Arc;

/// Context contributions gathered before assembly.
#[derive(Default)]
pub struct HookContext {
    /// Replaces the store-held conversation summary when present.
    pub context_summary: Option<String>,

    /// Pre-supplied retrieval text; suppresses the prefetch consumption.
    pub retrieval_context: Option<String>,

    /// Integration/tooling metadata for the integrations section.
    pub integrations_info: Option<String>,

    /// A prefetch handle started by the agent itself (e.g. with a custom
    /// query); the pipeline uses it instead of starting its own.
    pub prefetch: Option<Arc<RetrievalPrefetch>>,
}

/// Overrides gathered between assembly and generation.
#[derive(Debug, Clone, Default)]
pub struct GenerateOverrides {
    /// Replaces the user prompt content sent to the model.
    pub prompt_content: Option<String>,

    /// Additional system-context messages, placed in the first group.
    pub system_context_messages: Option<Vec<ThreadMessage>>,
}

/// The pipeline extension points. All optional.
#[async_trait]
pub trait TurnHooks: Send + Sync {
    /// Runs before context assembly.
    async fn before_context(&self, _args: &TurnArgs) -> HookContext {
        HookContext::default()
    }

    /// Runs after assembly, before the model call.
    async fn before_generate(
        &self,
        _args: &TurnArgs,
        _context: &MergedContext,
        _hook_context: &HookContext,
    ) -> GenerateOverrides {
        GenerateOverrides::default()
    }

    /// Runs after a successful generation, before persistence.
    async fn after_generate(
        &self,
        _args: &TurnArgs,
        _result: &TurnResult,
        _hook_context: &HookContext,
    ) {
    }

    /// Runs when the turn fails, before the failed record is persisted.
    async fn on_error(&self, _args: &TurnArgs, _error: &opsdesk_core::Error) {}
}

/// The no-op hook set used when an agent registers nothing.
pub struct NoHooks;

#[async_trait]
impl TurnHooks for NoHooks {}
