//! Conversation timeline.
//!
//! The reducer merges two sources into one ordered item list: live streaming
//! events for the active turn, and authoritative history snapshots ("traces")
//! fetched from the server. See [`reducer::TimelineReducer`].

pub mod reconcile;
pub mod reducer;
mod trace_map;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use reconcile::{ReconcilePlan, plan_reconciliation};
pub use reducer::{MemoryPressureReport, TimelineLimits, TimelineReducer};
pub(crate) use trace_map::compaction_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    Allowed,
    Denied,
    Expired,
    Cancelled,
}

impl PermissionOutcome {
    /// Parse the outcome strings used in traces.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allowed" | "allow" | "approved" => Some(Self::Allowed),
            "denied" | "deny" | "rejected" => Some(Self::Denied),
            "expired" | "timeout" => Some(Self::Expired),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One rendered entry of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TimelineItem {
    UserMessage {
        id: String,
        text: String,
        image_count: u32,
        timestamp: Option<DateTime<Utc>>,
    },
    AssistantMessage {
        id: String,
        text: String,
        timestamp: Option<DateTime<Utc>>,
    },
    Thinking {
        id: String,
        text: String,
    },
    ToolCall {
        id: String,
        tool: String,
        args_summary: String,
        output_preview: String,
        output_bytes: usize,
        truncated: bool,
        status: ToolCallStatus,
        is_error: bool,
        expanded: bool,
    },
    /// Unresolved permission gate. Holds its place in the turn but is not
    /// shown; the pending request lives in the permission store.
    Permission {
        id: String,
        tool: String,
        summary: String,
    },
    PermissionResolved {
        id: String,
        permission_id: String,
        tool: String,
        outcome: PermissionOutcome,
    },
    SystemEvent {
        id: String,
        message: String,
    },
    Error {
        id: String,
        message: String,
        fatal: bool,
    },
    AudioClip {
        id: String,
        title: String,
        duration_ms: Option<u64>,
    },
}

impl TimelineItem {
    pub fn id(&self) -> &str {
        match self {
            Self::UserMessage { id, .. }
            | Self::AssistantMessage { id, .. }
            | Self::Thinking { id, .. }
            | Self::ToolCall { id, .. }
            | Self::Permission { id, .. }
            | Self::PermissionResolved { id, .. }
            | Self::SystemEvent { id, .. }
            | Self::Error { id, .. }
            | Self::AudioClip { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::UserMessage { timestamp, .. } | Self::AssistantMessage { timestamp, .. } => {
                *timestamp
            }
            _ => None,
        }
    }

    /// Whether presentation should show this item.
    pub fn is_visible(&self) -> bool {
        !matches!(self, Self::Permission { .. })
    }
}

/// Collapse duplicate ids: the latest content wins, at the earliest position.
pub fn dedupe_keep_last(items: Vec<TimelineItem>) -> Vec<TimelineItem> {
    let mut position: HashMap<String, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<TimelineItem> = Vec::with_capacity(items.len());
    for item in items {
        match position.get(item.id()) {
            Some(&index) => out[index] = item,
            None => {
                position.insert(item.id().to_string(), out.len());
                out.push(item);
            }
        }
    }
    out
}
