//! Messages sent from the server to the client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AckStage, SessionInfo};

/// Inbound message, tagged by `type`.
///
/// Per-session messages carry a `sessionId` so a single connection can
/// multiplex several sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    // ========== Connection lifecycle ==========
    /// Socket handshake completed.
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SessionInfo>,
    },

    /// Full session state snapshot.
    State { session: SessionInfo },

    /// Server confirmed the session is gone.
    SessionEnded {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Someone asked the agent to stop.
    StopRequested {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },

    /// The agent stopped.
    StopConfirmed { session_id: String },

    /// Stopping the agent failed.
    StopFailed {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ========== Streaming ==========
    /// Agent begins a turn.
    AgentStart { session_id: String },

    /// Agent finished the turn.
    AgentEnd { session_id: String },

    /// Assistant text delta.
    TextDelta { session_id: String, delta: String },

    /// Thinking/reasoning delta.
    ThinkingDelta { session_id: String, delta: String },

    /// The current assistant message is complete.
    MessageEnd {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },

    // ========== Tools ==========
    /// Tool execution started.
    ToolStart {
        session_id: String,
        tool_call_id: String,
        tool: String,
        #[serde(default)]
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// Chunk of tool output.
    ToolOutput {
        session_id: String,
        tool_call_id: String,
        output: String,
    },

    /// Tool execution finished.
    ToolEnd {
        session_id: String,
        tool_call_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    // ========== Permissions ==========
    /// Agent asks to run a gated tool.
    PermissionRequest {
        session_id: String,
        id: String,
        tool: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        display_summary: String,
        /// Unix milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<i64>,
    },

    /// A permission request timed out on the server.
    PermissionExpired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        id: String,
    },

    /// A permission request was withdrawn.
    PermissionCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        id: String,
    },

    // ========== Command acknowledgement ==========
    /// Progress of a turn command.
    TurnAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        turn_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        stage: AckStage,
    },

    /// Terminal result of a command.
    CommandResult {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    // ========== Compaction ==========
    CompactionStart {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    CompactionEnd {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_before: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_after: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default)]
        aborted: bool,
    },

    // ========== Retry telemetry ==========
    RetryStart {
        session_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },

    RetryEnd {
        session_id: String,
        success: bool,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_error: Option<String>,
    },

    // ========== Extension UI ==========
    /// Extension dialog (select / confirm / input).
    ExtensionUiRequest {
        session_id: String,
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
        /// Milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },

    /// Fire-and-forget extension notification.
    ExtensionUiNotification {
        session_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
    },

    // ========== Errors ==========
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default)]
        fatal: bool,
    },

    /// Message type this client does not know. Never produced by serde;
    /// see [`crate::codec::decode_value`].
    #[serde(skip)]
    Unknown { message_type: String },
}

impl ServerMessage {
    /// Wire tags that decode into a concrete variant.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "connected",
        "state",
        "session_ended",
        "stop_requested",
        "stop_confirmed",
        "stop_failed",
        "agent_start",
        "agent_end",
        "text_delta",
        "thinking_delta",
        "message_end",
        "tool_start",
        "tool_output",
        "tool_end",
        "permission_request",
        "permission_expired",
        "permission_cancelled",
        "turn_ack",
        "command_result",
        "compaction_start",
        "compaction_end",
        "retry_start",
        "retry_end",
        "extension_ui_request",
        "extension_ui_notification",
        "error",
    ];

    pub fn is_known_type(tag: &str) -> bool {
        Self::KNOWN_TYPES.contains(&tag)
    }

    /// The wire tag of this message.
    pub fn message_type(&self) -> &str {
        match self {
            Self::Connected { .. } => "connected",
            Self::State { .. } => "state",
            Self::SessionEnded { .. } => "session_ended",
            Self::StopRequested { .. } => "stop_requested",
            Self::StopConfirmed { .. } => "stop_confirmed",
            Self::StopFailed { .. } => "stop_failed",
            Self::AgentStart { .. } => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolOutput { .. } => "tool_output",
            Self::ToolEnd { .. } => "tool_end",
            Self::PermissionRequest { .. } => "permission_request",
            Self::PermissionExpired { .. } => "permission_expired",
            Self::PermissionCancelled { .. } => "permission_cancelled",
            Self::TurnAck { .. } => "turn_ack",
            Self::CommandResult { .. } => "command_result",
            Self::CompactionStart { .. } => "compaction_start",
            Self::CompactionEnd { .. } => "compaction_end",
            Self::RetryStart { .. } => "retry_start",
            Self::RetryEnd { .. } => "retry_end",
            Self::ExtensionUiRequest { .. } => "extension_ui_request",
            Self::ExtensionUiNotification { .. } => "extension_ui_notification",
            Self::Error { .. } => "error",
            Self::Unknown { message_type } => message_type,
        }
    }

    /// Session this message belongs to, if it is session-scoped.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::State { session } => Some(&session.id),
            Self::SessionEnded { session_id, .. }
            | Self::StopRequested { session_id, .. }
            | Self::StopConfirmed { session_id }
            | Self::StopFailed { session_id, .. }
            | Self::AgentStart { session_id }
            | Self::AgentEnd { session_id }
            | Self::TextDelta { session_id, .. }
            | Self::ThinkingDelta { session_id, .. }
            | Self::MessageEnd { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::ToolOutput { session_id, .. }
            | Self::ToolEnd { session_id, .. }
            | Self::PermissionRequest { session_id, .. }
            | Self::CompactionStart { session_id, .. }
            | Self::CompactionEnd { session_id, .. }
            | Self::RetryStart { session_id, .. }
            | Self::RetryEnd { session_id, .. }
            | Self::ExtensionUiRequest { session_id, .. }
            | Self::ExtensionUiNotification { session_id, .. } => Some(session_id),
            Self::PermissionExpired { session_id, .. }
            | Self::PermissionCancelled { session_id, .. }
            | Self::TurnAck { session_id, .. }
            | Self::CommandResult { session_id, .. }
            | Self::Error { session_id, .. } => session_id.as_deref(),
            Self::Connected { session, .. } => session.as_ref().map(|s| s.id.as_str()),
            Self::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_types_match_message_type() {
        let msg = ServerMessage::TextDelta {
            session_id: "s1".to_string(),
            delta: "hi".to_string(),
        };
        assert!(ServerMessage::is_known_type(msg.message_type()));
        assert!(!ServerMessage::is_known_type("session_renamed"));
    }

    #[test]
    fn test_tool_start_serialization() {
        let msg = ServerMessage::ToolStart {
            session_id: "s1".to_string(),
            tool_call_id: "tc_1".to_string(),
            tool: "bash".to_string(),
            args: serde_json::json!({"command": "ls"}),
            details: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"tool_start\""));
        assert!(json.contains("\"toolCallId\":\"tc_1\""));
        assert!(json.contains("\"sessionId\":\"s1\""));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_session_id_accessor() {
        let ack = ServerMessage::TurnAck {
            session_id: None,
            turn_id: "t1".to_string(),
            request_id: None,
            stage: AckStage::Accepted,
        };
        assert_eq!(ack.session_id(), None);

        let perm = ServerMessage::PermissionRequest {
            session_id: "s2".to_string(),
            id: "p1".to_string(),
            tool: "bash".to_string(),
            input: Value::Null,
            display_summary: "rm -rf build".to_string(),
            expires_at: None,
        };
        assert_eq!(perm.session_id(), Some("s2"));
    }
}
