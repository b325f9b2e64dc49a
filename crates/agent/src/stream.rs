//! Turn-level streaming events.
//!
//! `TurnStreamEvent` wraps provider-level stream chunks into higher-level
//! events that the platform can forward to clients over SSE or WebSocket.

use opsdesk_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// Events emitted by the pipeline during a streaming turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnStreamEvent {
    /// Partial text token from the LLM.
    Chunk { content: String },

    /// The model requested a tool invocation.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },

    /// The stream is complete — final metadata.
    Done {
        thread_id: String,
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// An error occurred mid-stream; the stream is terminal after this.
    Error { message: String },
}

impl TurnStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_their_type_in_json() {
        let event = TurnStreamEvent::Chunk {
            content: "partial".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert_eq!(event.event_type(), "chunk");
    }

    #[test]
    fn error_event_roundtrips() {
        let event = TurnStreamEvent::Error {
            message: "stream interrupted".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: TurnStreamEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, TurnStreamEvent::Error { message } if message == "stream interrupted"));
    }
}
