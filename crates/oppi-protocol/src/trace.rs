//! Canonical session history ("trace") as served by the history snapshot API.
//!
//! A trace is an ordered list of events with globally stable ids. Clients
//! rebuild their timeline from it after reconnects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a session trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Stable across snapshots.
    pub id: String,

    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(flatten)]
    pub kind: TraceEventKind,
}

impl TraceEvent {
    pub fn new(id: impl Into<String>, kind: TraceEventKind) -> Self {
        Self {
            id: id.into(),
            timestamp: None,
            kind,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Trace event payloads, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TraceEventKind {
    /// User prompt.
    User {
        text: String,
        #[serde(default)]
        image_count: u32,
    },

    /// Assistant message, possibly interleaving text, thinking and tool calls.
    Assistant { content: Vec<AssistantBlock> },

    /// Output of a tool call made by an earlier assistant event.
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },

    /// Permission gate recorded in history.
    Permission {
        permission_id: String,
        tool: String,
        #[serde(default)]
        summary: String,
        /// "allowed", "denied", "expired", "cancelled"; absent while pending.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<String>,
    },

    /// Informational event (model change, stop, ...).
    System { message: String },

    /// Error recorded by the server.
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },

    /// Context compaction.
    Compaction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_before: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Voice clip attached to the conversation.
    Audio {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    /// Event kind added by a newer server.
    #[serde(other)]
    Unknown,
}

/// Content block of an assistant trace event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AssistantBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}
