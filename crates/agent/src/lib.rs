//! The turn generation pipeline — the top-level orchestrator of Opsdesk.
//!
//! One turn runs a linear state machine with a single error branch:
//!
//! 1. **before_context hook** — agents inject summaries, retrieval, metadata
//! 2. **Build context** — budget engine assembles and reorders (see
//!    `opsdesk-context`)
//! 3. **before_generate hook** — prompt/system overrides
//! 4. **Invoke the model** — streaming XOR buffered
//! 5. **Extract telemetry** — tool calls and sub-agent usage rollup
//! 6. **after_generate hook**, persist, return
//!
//! On failure at any stage: the open stream is marked errored, the
//! `on_error` hook runs, a terminal failed record is persisted best-effort,
//! and the ORIGINAL error is rethrown untouched. Classification for retry
//! happens only at the outermost boundary, via [`classify`].

pub mod classify;
pub mod hooks;
pub mod prefetch;
pub mod stream;
pub mod summarize;
pub mod turn;

pub use classify::{classify, ErrorClassification, FailureInfo, NonRetryableError, ReasonCode};
pub use hooks::{GenerateOverrides, HookContext, TurnHooks};
pub use prefetch::RetrievalPrefetch;
pub use stream::TurnStreamEvent;
pub use summarize::SummarizationTrigger;
pub use turn::{SubAgentUsage, TurnArgs, TurnPipeline, TurnResult};
