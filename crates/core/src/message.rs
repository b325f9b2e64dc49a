//! Thread message domain types.
//!
//! These are the core value objects that flow through the turn engine:
//! a user sends a message → the pipeline builds context around it →
//! the provider generates a response → the response is appended to the thread.
//!
//! Messages are externally owned: the engine reads them in increasing
//! `(order, step_order)` key order and never mutates persisted history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user (a staff member of the organization)
    User,
    /// One of the AI agents
    Assistant,
    /// System instructions (identity, rules)
    System,
    /// Tool execution result
    Tool,
}

/// A structured, non-plain-text part of a message.
///
/// Tool calls, tool results, and images each carry their own token-cost
/// profile, so the estimator handles them separately from `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Additional plain text.
    Text { text: String },

    /// An image reference (URL or attachment id). Charged at a flat rate.
    Image { source: String },

    /// A tool invocation with JSON arguments.
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// The result payload of an earlier tool invocation.
    ToolResult {
        id: String,
        output: serde_json::Value,
    },
}

/// A single message in a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Structured content parts (tool calls, results, images)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// Primary ordering key within the thread
    #[serde(default)]
    pub order: i64,

    /// Secondary ordering key for multi-step generations within one turn
    #[serde(default)]
    pub step_order: i64,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (status, error, approval info, provider info, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ThreadMessage {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            order: 0,
            step_order: 0,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, output: serde_json::Value) -> Self {
        let mut msg = Self::base(Role::Tool, String::new());
        msg.parts.push(ContentPart::ToolResult {
            id: tool_call_id.into(),
            output,
        });
        msg
    }

    /// Set the `(order, step_order)` keys.
    pub fn with_order(mut self, order: i64, step_order: i64) -> Self {
        self.order = order;
        self.step_order = step_order;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The sort key used when reading thread history.
    pub fn sort_key(&self) -> (i64, i64) {
        (self.order, self.step_order)
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON string
    pub arguments: String,
}
