//! Shared wire types used by both message directions.

use serde::{Deserialize, Serialize};

// ============================================================================
// Sessions
// ============================================================================

/// Lifecycle status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Agent process is being spawned.
    #[default]
    Starting,
    /// Idle, waiting for a prompt.
    Ready,
    /// A turn is in progress.
    Busy,
    /// Stop was requested and is being processed.
    Stopping,
    /// Agent process has exited.
    Stopped,
    /// Session is in a failed state.
    Error,
}

impl SessionStatus {
    /// Whether a turn is currently running.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Busy | Self::Stopping)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Token and cost counters for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost: f64,
}

/// Session snapshot as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(default)]
    pub status: SessionStatus,

    #[serde(default)]
    pub usage: Usage,

    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Model ID (e.g. "claude-sonnet-4-20250514").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Workspace summary returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub id: String,
    pub name: String,
}

// ============================================================================
// Command acknowledgement
// ============================================================================

/// Progress milestone reported for an in-flight turn before any terminal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStage {
    /// Server received and validated the command.
    Accepted,
    /// Server durably queued the turn for the agent.
    Dispatched,
    /// The agent began processing the turn.
    Started,
    /// Stage added by a newer server.
    #[serde(other)]
    Unknown,
}

impl AckStage {
    /// Ordering of stages. Unknown stages rank below everything.
    pub fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Accepted => 1,
            Self::Dispatched => 2,
            Self::Started => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Dispatched => "dispatched",
            Self::Started => "started",
            Self::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Subscriptions and permissions
// ============================================================================

/// How much of a session's stream the client wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionLevel {
    /// Full streaming content (deltas, tools).
    Full,
    /// Only lifecycle and permission notifications.
    Notifications,
}

/// Answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Allow,
    Deny,
}

/// Image attachment for prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    /// Base64-encoded image data.
    pub data: String,
    /// MIME type (e.g. "image/png").
    pub media_type: String,
}
