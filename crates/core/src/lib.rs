//! # Opsdesk Core
//!
//! Domain types, traits, and error definitions for the Opsdesk turn engine.
//! This crate has **zero framework dependencies** — it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator the turn engine talks to is defined as a trait here:
//! the model provider, the thread store, the retrieval service, and the
//! summarizer. Implementations live in the embedding platform. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod store;
pub mod summarizer;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, RetrievalError, StoreError};
pub use message::{Role, ThreadId, ThreadMessage, ToolInvocation};
pub use provider::{ModelProvider, ModelRequest, ModelResponse, StreamChunk, ToolDefinition, Usage};
pub use retrieval::{RetrievalOutcome, RetrievalService};
pub use store::{SummaryState, ThreadStore};
pub use summarizer::Summarizer;
