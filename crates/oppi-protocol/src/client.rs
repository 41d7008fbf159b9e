//! Messages sent from the client to the server.
//!
//! Every command carries a `requestId` that the server echoes in its
//! `command_result`. Turn commands (prompt, steer, follow-up) additionally
//! carry a `turnId` that stays the same across retries of one user action,
//! so the server can de-duplicate them.

use serde::{Deserialize, Serialize};

use crate::types::{ImageAttachment, PermissionAction, SubscriptionLevel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    // ========== Turns ==========
    /// Send a user prompt.
    Prompt {
        session_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageAttachment>,
        request_id: String,
        turn_id: String,
    },

    /// Steering message (interrupt mid-run).
    Steer {
        session_id: String,
        message: String,
        request_id: String,
        turn_id: String,
    },

    /// Follow-up message (queued for after the current run).
    FollowUp {
        session_id: String,
        message: String,
        request_id: String,
        turn_id: String,
    },

    // ========== Subscriptions ==========
    Subscribe {
        session_id: String,
        level: SubscriptionLevel,
        request_id: String,
    },

    Unsubscribe {
        session_id: String,
        request_id: String,
    },

    // ========== Queries ==========
    GetState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        request_id: String,
    },

    /// Available slash commands (extensions, templates, skills).
    GetCommands {
        session_id: String,
        request_id: String,
    },

    /// User messages that can be forked from.
    GetForkMessages {
        session_id: String,
        request_id: String,
    },

    // ========== Session control ==========
    /// Fork a new session from a previous entry.
    Fork {
        session_id: String,
        entry_id: String,
        request_id: String,
    },

    /// Abort the current run.
    Stop {
        session_id: String,
        request_id: String,
    },

    // ========== Responses to server prompts ==========
    PermissionResponse {
        id: String,
        action: PermissionAction,
        request_id: String,
    },

    ExtensionUiResponse {
        session_id: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirmed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cancelled: Option<bool>,
        request_id: String,
    },
}

impl ClientMessage {
    /// Command name as echoed in `command_result.command`.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Steer { .. } => "steer",
            Self::FollowUp { .. } => "follow_up",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::GetState { .. } => "get_state",
            Self::GetCommands { .. } => "get_commands",
            Self::GetForkMessages { .. } => "get_fork_messages",
            Self::Fork { .. } => "fork",
            Self::Stop { .. } => "stop",
            Self::PermissionResponse { .. } => "permission_response",
            Self::ExtensionUiResponse { .. } => "extension_ui_response",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Prompt { request_id, .. }
            | Self::Steer { request_id, .. }
            | Self::FollowUp { request_id, .. }
            | Self::Subscribe { request_id, .. }
            | Self::Unsubscribe { request_id, .. }
            | Self::GetState { request_id, .. }
            | Self::GetCommands { request_id, .. }
            | Self::GetForkMessages { request_id, .. }
            | Self::Fork { request_id, .. }
            | Self::Stop { request_id, .. }
            | Self::PermissionResponse { request_id, .. }
            | Self::ExtensionUiResponse { request_id, .. } => request_id,
        }
    }

    /// Idempotency key for turn commands.
    pub fn turn_id(&self) -> Option<&str> {
        match self {
            Self::Prompt { turn_id, .. }
            | Self::Steer { turn_id, .. }
            | Self::FollowUp { turn_id, .. } => Some(turn_id),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Prompt { session_id, .. }
            | Self::Steer { session_id, .. }
            | Self::FollowUp { session_id, .. }
            | Self::Subscribe { session_id, .. }
            | Self::Unsubscribe { session_id, .. }
            | Self::GetCommands { session_id, .. }
            | Self::GetForkMessages { session_id, .. }
            | Self::Fork { session_id, .. }
            | Self::Stop { session_id, .. }
            | Self::ExtensionUiResponse { session_id, .. } => Some(session_id),
            Self::GetState { session_id, .. } => session_id.as_deref(),
            Self::PermissionResponse { .. } => None,
        }
    }
}
