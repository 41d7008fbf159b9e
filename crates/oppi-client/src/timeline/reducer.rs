//! Event-to-timeline reducer.
//!
//! ## Turn state machine
//!
//! `idle -> started -> (delta* | tool-call-cycle)* -> ended`
//!
//! 1. Text and thinking deltas accumulate in buffers.
//! 2. A boundary (tool start, message end, turn end) commits the buffers as
//!    items. Whitespace-only buffers are dropped.
//! 3. `started` resets the buffers and never removes committed items.
//! 4. Tools still open at turn end are force-closed.
//!
//! ## Snapshots
//!
//! [`TimelineReducer::load_session`] reconciles a history snapshot with the
//! rendered items using [`plan_reconciliation`]. Every local mutation sets the
//! dirty flag so the next snapshot is applied as a full rebuild.

use std::collections::HashSet;

use chrono::Utc;
use oppi_protocol::{ServerMessage, TraceEvent};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::reconcile::{ReconcilePlan, plan_reconciliation};
use super::trace_map::{TraceMapper, is_tool_call, new_tool_call, summarize_args};
use super::{PermissionOutcome, TimelineItem, ToolCallStatus, dedupe_keep_last};
use crate::stores::{ToolArgsStore, ToolOutputStore};

/// Byte caps for tool bodies held by the reducer.
#[derive(Debug, Clone, Copy)]
pub struct TimelineLimits {
    pub tool_output_item_bytes: usize,
    pub tool_output_total_bytes: usize,
    pub tool_args_item_bytes: usize,
    pub tool_args_total_bytes: usize,
}

impl Default for TimelineLimits {
    fn default() -> Self {
        Self {
            tool_output_item_bytes: 256 * 1024,
            tool_output_total_bytes: 8 * 1024 * 1024,
            tool_args_item_bytes: 64 * 1024,
            tool_args_total_bytes: 2 * 1024 * 1024,
        }
    }
}

/// What [`TimelineReducer::handle_memory_pressure`] released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPressureReport {
    pub output_bytes: usize,
    pub output_items: usize,
    pub args_bytes: usize,
    pub args_items: usize,
    pub collapsed_items: usize,
}

#[derive(Debug, Default)]
struct TurnState {
    active: bool,
    text: String,
    thinking: String,
    open_tools: Vec<String>,
    /// Index of the first item committed during this turn.
    first_item: usize,
}

impl TurnState {
    fn clear_buffers(&mut self) {
        self.text.clear();
        self.thinking.clear();
    }
}

pub struct TimelineReducer {
    items: Vec<TimelineItem>,
    generation: u64,
    dirty: bool,
    rendered_trace_ids: Vec<String>,
    turn: TurnState,
    outputs: ToolOutputStore,
    args: ToolArgsStore,
    live_seq: u64,
}

impl TimelineReducer {
    pub fn new(limits: TimelineLimits) -> Self {
        Self {
            items: Vec::new(),
            generation: 0,
            dirty: false,
            rendered_trace_ids: Vec::new(),
            turn: TurnState::default(),
            outputs: ToolOutputStore::new(
                limits.tool_output_item_bytes,
                limits.tool_output_total_bytes,
            ),
            args: ToolArgsStore::new(limits.tool_args_item_bytes, limits.tool_args_total_bytes),
            live_seq: 0,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    /// Items presentation should show, in order.
    pub fn visible_items(&self) -> impl Iterator<Item = &TimelineItem> {
        self.items.iter().filter(|item| item.is_visible())
    }

    pub fn find(&self, id: &str) -> Option<&TimelineItem> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn rendered_trace_ids(&self) -> &[String] {
        &self.rendered_trace_ids
    }

    pub fn is_turn_active(&self) -> bool {
        self.turn.active
    }

    /// Uncommitted assistant text of the current turn.
    pub fn streaming_text(&self) -> &str {
        &self.turn.text
    }

    pub fn streaming_thinking(&self) -> &str {
        &self.turn.thinking
    }

    pub fn tool_outputs(&self) -> &ToolOutputStore {
        &self.outputs
    }

    pub fn tool_args(&self) -> &ToolArgsStore {
        &self.args
    }

    /// Forget everything, e.g. when switching sessions.
    pub fn reset(&mut self) {
        self.items.clear();
        self.rendered_trace_ids.clear();
        self.turn = TurnState::default();
        self.outputs.clear();
        self.args.clear();
        self.dirty = false;
        self.generation += 1;
    }

    fn bump(&mut self) {
        self.generation += 1;
    }

    fn mutate_local(&mut self) {
        self.generation += 1;
        self.dirty = true;
    }

    fn next_live_id(&mut self, kind: &str) -> String {
        self.live_seq += 1;
        format!("live-{}-{kind}", self.live_seq)
    }

    // ========================================================================
    // Live events
    // ========================================================================

    /// Apply a streaming event. Returns false for messages the reducer does
    /// not handle.
    pub fn apply_live(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::AgentStart { .. } => self.on_turn_start(),
            ServerMessage::AgentEnd { .. } => self.on_turn_end(),
            ServerMessage::TextDelta { delta, .. } => self.on_text_delta(delta),
            ServerMessage::ThinkingDelta { delta, .. } => self.on_thinking_delta(delta),
            ServerMessage::MessageEnd { .. } => self.on_message_end(),
            ServerMessage::ToolStart {
                tool_call_id,
                tool,
                args,
                ..
            } => self.on_tool_start(tool_call_id, tool, args),
            ServerMessage::ToolOutput {
                tool_call_id,
                output,
                ..
            } => self.on_tool_output(tool_call_id, output),
            ServerMessage::ToolEnd {
                tool_call_id,
                is_error,
                ..
            } => self.on_tool_end(tool_call_id, *is_error),
            _ => return false,
        }
        true
    }

    pub fn on_turn_start(&mut self) {
        if self.turn.active {
            debug!(
                dropped_text = self.turn.text.len(),
                dropped_thinking = self.turn.thinking.len(),
                "turn restarted without end, resetting buffers"
            );
        } else {
            self.turn.first_item = self.items.len();
            self.turn.open_tools.clear();
        }
        self.turn.clear_buffers();
        self.turn.active = true;
        self.mutate_local();
    }

    pub fn on_text_delta(&mut self, delta: &str) {
        self.turn.text.push_str(delta);
        self.mutate_local();
    }

    pub fn on_thinking_delta(&mut self, delta: &str) {
        self.turn.thinking.push_str(delta);
        self.mutate_local();
    }

    pub fn on_message_end(&mut self) {
        self.flush_buffers();
        self.mutate_local();
    }

    pub fn on_tool_start(&mut self, id: &str, tool: &str, args: &Value) {
        self.flush_buffers();
        self.args.insert(id, args);

        let existing = self.items.iter().position(|item| is_tool_call(item, id));
        if let Some(index) = existing
            && let TimelineItem::ToolCall {
                tool: item_tool,
                args_summary,
                ..
            } = &mut self.items[index]
        {
            *item_tool = tool.to_string();
            *args_summary = summarize_args(args);
        } else {
            self.items.push(new_tool_call(id, tool, args));
        }
        if !self.turn.open_tools.iter().any(|open| open == id) {
            self.turn.open_tools.push(id.to_string());
        }
        self.mutate_local();
    }

    pub fn on_tool_output(&mut self, id: &str, chunk: &str) {
        let Some(TimelineItem::ToolCall {
            output_preview,
            output_bytes,
            truncated,
            ..
        }) = self.items.iter_mut().find(|item| is_tool_call(item, id))
        else {
            debug!(tool_call_id = id, "output for unknown tool call ignored");
            return;
        };
        self.outputs.append(id, chunk);
        *output_bytes += chunk.len();
        *output_preview = self.outputs.preview(id).unwrap_or_default().to_string();
        *truncated = self.outputs.is_truncated(id);
        self.mutate_local();
    }

    pub fn on_tool_end(&mut self, id: &str, failed: bool) {
        let Some(TimelineItem::ToolCall {
            status, is_error, ..
        }) = self.items.iter_mut().find(|item| is_tool_call(item, id))
        else {
            debug!(tool_call_id = id, "end for unknown tool call ignored");
            return;
        };
        *status = ToolCallStatus::Done;
        *is_error = failed;
        self.turn.open_tools.retain(|open| open != id);
        self.mutate_local();
    }

    pub fn on_turn_end(&mut self) {
        self.flush_buffers();
        let open = std::mem::take(&mut self.turn.open_tools);
        for id in &open {
            if let Some(TimelineItem::ToolCall { status, .. }) =
                self.items.iter_mut().find(|item| is_tool_call(item, id))
                && *status == ToolCallStatus::Running
            {
                debug!(tool_call_id = %id, "force-closing tool at turn end");
                *status = ToolCallStatus::Done;
            }
        }
        self.turn.active = false;
        self.mutate_local();
    }

    /// Commit buffered thinking and text.
    fn flush_buffers(&mut self) {
        let thinking = std::mem::take(&mut self.turn.thinking);
        if !thinking.trim().is_empty() {
            let id = self.next_live_id("thinking");
            self.items.push(TimelineItem::Thinking { id, text: thinking });
        }

        let text = std::mem::take(&mut self.turn.text);
        if !text.trim().is_empty() {
            let id = self.next_live_id("text");
            self.items.push(TimelineItem::AssistantMessage {
                id,
                text,
                timestamp: Some(Utc::now()),
            });
        }
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    /// Keep the position of a permission gate raised during the current turn.
    pub fn add_permission_placeholder(&mut self, permission_id: &str, tool: &str, summary: &str) {
        if !self.turn.active {
            return;
        }
        self.flush_buffers();
        self.items.push(TimelineItem::Permission {
            id: permission_id.to_string(),
            tool: tool.to_string(),
            summary: summary.to_string(),
        });
        self.mutate_local();
    }

    /// Record the outcome of a permission request.
    ///
    /// Replaces the placeholder in place when it belongs to the in-progress
    /// turn; otherwise appends a marker and leaves history alone.
    pub fn resolve_permission(
        &mut self,
        permission_id: &str,
        tool: &str,
        outcome: PermissionOutcome,
    ) {
        let marker = TimelineItem::PermissionResolved {
            id: format!("{permission_id}-resolved"),
            permission_id: permission_id.to_string(),
            tool: tool.to_string(),
            outcome,
        };

        let inline = if self.turn.active {
            self.items
                .iter()
                .enumerate()
                .skip(self.turn.first_item)
                .find(|(_, item)| {
                    matches!(item, TimelineItem::Permission { id, .. } if id == permission_id)
                })
                .map(|(index, _)| index)
        } else {
            None
        };

        match inline {
            Some(index) => self.items[index] = marker,
            None => self.upsert(marker),
        }
        self.mutate_local();
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    /// Optimistic user message. Returns its id.
    pub fn append_user_message(&mut self, text: &str, image_count: u32) -> String {
        let id = local_id();
        self.items.push(TimelineItem::UserMessage {
            id: id.clone(),
            text: text.to_string(),
            image_count,
            timestamp: Some(Utc::now()),
        });
        self.mutate_local();
        id
    }

    pub fn append_system_event(&mut self, message: &str) -> String {
        let id = local_id();
        self.items.push(TimelineItem::SystemEvent {
            id: id.clone(),
            message: message.to_string(),
        });
        self.mutate_local();
        id
    }

    pub fn append_error(&mut self, message: &str, fatal: bool) -> String {
        let id = local_id();
        self.items.push(TimelineItem::Error {
            id: id.clone(),
            message: message.to_string(),
            fatal,
        });
        self.mutate_local();
        id
    }

    pub fn append_audio_clip(&mut self, title: &str, duration_ms: Option<u64>) -> String {
        let id = local_id();
        self.items.push(TimelineItem::AudioClip {
            id: id.clone(),
            title: title.to_string(),
            duration_ms,
        });
        self.mutate_local();
        id
    }

    pub fn remove_item(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id() != id);
        if self.items.len() == before {
            return false;
        }
        if self.turn.first_item > self.items.len() {
            self.turn.first_item = self.items.len();
        }
        self.outputs.remove(id);
        self.args.remove(id);
        self.turn.open_tools.retain(|open| open != id);
        self.mutate_local();
        true
    }

    /// Expand or collapse a tool call. Returns false for other items.
    pub fn set_expanded(&mut self, id: &str, value: bool) -> bool {
        let Some(TimelineItem::ToolCall { expanded, .. }) =
            self.items.iter_mut().find(|item| is_tool_call(item, id))
        else {
            return false;
        };
        if *expanded != value {
            *expanded = value;
            self.mutate_local();
        }
        true
    }

    /// Install a fetched full output body for a tool call.
    pub fn apply_full_output(&mut self, id: &str, body: &str) -> bool {
        let Some(TimelineItem::ToolCall {
            output_preview,
            output_bytes,
            truncated,
            ..
        }) = self.items.iter_mut().find(|item| is_tool_call(item, id))
        else {
            return false;
        };
        self.outputs.set(id, body);
        *output_bytes = body.len();
        *output_preview = self.outputs.preview(id).unwrap_or_default().to_string();
        *truncated = self.outputs.is_truncated(id);
        self.mutate_local();
        true
    }

    /// Insert, or replace in place when the id exists.
    fn upsert(&mut self, item: TimelineItem) {
        match self.items.iter_mut().find(|existing| existing.id() == item.id()) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Reconcile a history snapshot. Returns the plan that was applied.
    pub fn load_session(&mut self, events: &[TraceEvent]) -> ReconcilePlan {
        let new_ids: Vec<String> = events.iter().map(|event| event.id.clone()).collect();
        let plan = plan_reconciliation(&self.rendered_trace_ids, &new_ids, self.dirty);

        let applied = match plan {
            ReconcilePlan::Unchanged => return plan,
            ReconcilePlan::Incremental { from } => {
                if self.append_suffix(&events[from..]) {
                    plan
                } else {
                    self.rebuild(events);
                    ReconcilePlan::FullRebuild
                }
            }
            ReconcilePlan::FullRebuild => {
                self.rebuild(events);
                plan
            }
        };

        debug!(
            plan = ?applied,
            events = events.len(),
            items = self.items.len(),
            "reconciled snapshot"
        );
        self.rendered_trace_ids = new_ids;
        self.dirty = false;
        self.bump();
        applied
    }

    /// Append items for a suffix of events. False when the suffix would touch
    /// an existing item, in which case nothing was appended.
    fn append_suffix(&mut self, suffix: &[TraceEvent]) -> bool {
        let mut mapper = TraceMapper {
            outputs: &mut self.outputs,
            args: &mut self.args,
        };
        let new_items = match mapper.map(suffix, &self.items) {
            Ok(items) => items,
            Err(touch) => {
                debug!(
                    event_id = %touch.event_id,
                    item_id = %touch.item_id,
                    "suffix event modifies a rendered item"
                );
                return false;
            }
        };

        let prior: HashSet<&str> = self.items.iter().map(TimelineItem::id).collect();
        if let Some(clash) = new_items.iter().find(|item| prior.contains(item.id())) {
            debug!(item_id = clash.id(), "suffix item reuses a rendered id");
            return false;
        }

        self.items.extend(dedupe_keep_last(new_items));
        true
    }

    fn rebuild(&mut self, events: &[TraceEvent]) {
        self.outputs.clear();
        self.args.clear();
        let mut mapper = TraceMapper {
            outputs: &mut self.outputs,
            args: &mut self.args,
        };
        let items = mapper.map(events, &[]).unwrap_or_default();
        self.items = dedupe_keep_last(items);
        self.turn.clear_buffers();
        self.turn.open_tools.clear();
        self.turn.first_item = self.items.len();
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Release full tool bodies and collapse expanded items. Previews stay.
    pub fn handle_memory_pressure(&mut self) -> MemoryPressureReport {
        let (output_bytes, output_items) = self.outputs.clear_bodies();
        let (args_bytes, args_items) = self.args.clear_bodies();

        let mut collapsed_items = 0;
        for item in &mut self.items {
            if let TimelineItem::ToolCall { expanded, .. } = item
                && *expanded
            {
                *expanded = false;
                collapsed_items += 1;
            }
        }

        let report = MemoryPressureReport {
            output_bytes,
            output_items,
            args_bytes,
            args_items,
            collapsed_items,
        };
        info!(?report, "released timeline memory");
        self.mutate_local();
        report
    }
}

fn local_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oppi_protocol::{AssistantBlock, TraceEventKind};
    use serde_json::json;

    fn reducer() -> TimelineReducer {
        TimelineReducer::new(TimelineLimits::default())
    }

    fn kinds(reducer: &TimelineReducer) -> Vec<String> {
        reducer
            .items()
            .iter()
            .map(|item| match item {
                TimelineItem::AssistantMessage { text, .. } => format!("text:{text}"),
                TimelineItem::Thinking { text, .. } => format!("thinking:{text}"),
                TimelineItem::ToolCall { id, .. } => format!("tool:{id}"),
                other => format!("other:{}", other.id()),
            })
            .collect()
    }

    fn user(id: &str, text: &str) -> TraceEvent {
        TraceEvent::new(
            id,
            TraceEventKind::User {
                text: text.to_string(),
                image_count: 0,
            },
        )
    }

    fn reply(id: &str, text: &str) -> TraceEvent {
        TraceEvent::new(
            id,
            TraceEventKind::Assistant {
                content: vec![AssistantBlock::Text {
                    text: text.to_string(),
                }],
            },
        )
    }

    fn trace(n: usize) -> Vec<TraceEvent> {
        (1..=n)
            .map(|i| {
                if i % 2 == 1 {
                    user(&format!("e{i}"), &format!("question {i}"))
                } else {
                    reply(&format!("e{i}"), &format!("answer {i}"))
                }
            })
            .collect()
    }

    // -- Turn state machine --

    #[test]
    fn test_tool_boundary_splits_text() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_text_delta("Let me ");
        r.on_text_delta("check.");
        r.on_tool_start("tc_1", "bash", &json!({"command": "ls"}));
        r.on_tool_output("tc_1", "src\n");
        r.on_tool_end("tc_1", false);
        r.on_text_delta("Found it.");
        r.on_turn_end();

        assert_eq!(
            kinds(&r),
            vec!["text:Let me check.", "tool:tc_1", "text:Found it."]
        );
        assert!(!r.is_turn_active());
    }

    #[test]
    fn test_whitespace_buffers_dropped() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_text_delta("  \n ");
        r.on_tool_start("tc_1", "read", &json!({"path": "a"}));
        r.on_thinking_delta("\t");
        r.on_message_end();
        r.on_text_delta(" ");
        r.on_turn_end();
        assert_eq!(kinds(&r), vec!["tool:tc_1"]);
    }

    #[test]
    fn test_thinking_committed_before_text() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_thinking_delta("hmm");
        r.on_text_delta("Answer");
        r.on_message_end();
        r.on_text_delta("More");
        r.on_turn_end();
        assert_eq!(kinds(&r), vec!["thinking:hmm", "text:Answer", "text:More"]);
    }

    #[test]
    fn test_second_start_keeps_committed_items() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_text_delta("first");
        r.on_message_end();
        r.on_text_delta("lost partial");
        r.on_turn_start();
        r.on_text_delta("second");
        r.on_turn_end();
        assert_eq!(kinds(&r), vec!["text:first", "text:second"]);
    }

    #[test]
    fn test_tool_end_without_start_ignored() {
        let mut r = reducer();
        r.on_turn_start();
        let generation = r.generation();
        r.on_tool_end("ghost", true);
        r.on_tool_output("ghost", "x");
        assert!(r.items().is_empty());
        assert_eq!(r.generation(), generation);
    }

    #[test]
    fn test_repeated_tool_start_updates_in_place() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_tool_start("tc_1", "bash", &json!({"command": "ls"}));
        r.on_tool_start("tc_1", "bash", &json!({"command": "ls -la"}));
        assert_eq!(r.items().len(), 1);
        assert!(matches!(
            &r.items()[0],
            TimelineItem::ToolCall { args_summary, .. } if args_summary == "ls -la"
        ));
    }

    #[test]
    fn test_open_tools_force_closed_at_turn_end() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_tool_start("tc_1", "bash", &json!({}));
        r.on_tool_output("tc_1", "partial");
        r.on_turn_end();
        match &r.items()[0] {
            TimelineItem::ToolCall {
                status,
                output_preview,
                ..
            } => {
                assert_eq!(*status, ToolCallStatus::Done);
                assert_eq!(output_preview, "partial");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_apply_live_dispatch() {
        let mut r = reducer();
        assert!(r.apply_live(&ServerMessage::AgentStart {
            session_id: "s1".to_string()
        }));
        assert!(r.apply_live(&ServerMessage::TextDelta {
            session_id: "s1".to_string(),
            delta: "hi".to_string()
        }));
        assert_eq!(r.streaming_text(), "hi");
        assert!(!r.apply_live(&ServerMessage::StopConfirmed {
            session_id: "s1".to_string()
        }));
        assert!(r.is_dirty());
    }

    // -- Snapshots --

    #[test]
    fn test_incremental_append_leaves_prior_untouched() {
        let mut r = reducer();
        assert_eq!(r.load_session(&trace(3)), ReconcilePlan::Incremental { from: 0 });
        let before: Vec<TimelineItem> = r.items().to_vec();
        let generation = r.generation();

        let plan = r.load_session(&trace(5));
        assert_eq!(plan, ReconcilePlan::Incremental { from: 3 });
        assert_eq!(r.generation(), generation + 1);
        assert_eq!(&r.items()[..before.len()], before.as_slice());
        assert_eq!(r.items().len(), 5);
        assert!(!r.is_dirty());
    }

    #[test]
    fn test_identical_snapshot_is_unchanged() {
        let mut r = reducer();
        r.load_session(&trace(4));
        let generation = r.generation();
        assert_eq!(r.load_session(&trace(4)), ReconcilePlan::Unchanged);
        assert_eq!(r.generation(), generation);
    }

    #[test]
    fn test_local_mutation_forces_full_rebuild() {
        let mut r = reducer();
        r.load_session(&trace(3));
        r.append_user_message("optimistic", 0);
        assert!(r.is_dirty());

        let plan = r.load_session(&trace(4));
        assert_eq!(plan, ReconcilePlan::FullRebuild);
        assert!(!r.is_dirty());
        let ids: Vec<&str> = r.items().iter().map(TimelineItem::id).collect();
        assert_eq!(ids, vec!["e1", "e2-text-0", "e3", "e4-text-0"]);
    }

    #[test]
    fn test_divergent_or_shorter_trace_rebuilds() {
        let mut r = reducer();
        r.load_session(&trace(4));
        assert_eq!(r.load_session(&trace(2)), ReconcilePlan::FullRebuild);
        assert_eq!(r.items().len(), 2);

        let mut divergent = trace(3);
        divergent[0] = user("x1", "edited");
        assert_eq!(r.load_session(&divergent), ReconcilePlan::FullRebuild);
        assert_eq!(r.items()[0].id(), "x1");
    }

    #[test]
    fn test_suffix_touching_prior_item_rebuilds() {
        let mut r = reducer();
        let mut events = vec![
            user("e1", "run ls"),
            TraceEvent::new(
                "e2",
                TraceEventKind::Assistant {
                    content: vec![AssistantBlock::ToolCall {
                        id: "tc_1".to_string(),
                        name: "bash".to_string(),
                        arguments: json!({"command": "ls"}),
                    }],
                },
            ),
        ];
        r.load_session(&events);

        events.push(TraceEvent::new(
            "e3",
            TraceEventKind::ToolResult {
                tool_call_id: "tc_1".to_string(),
                output: "src".to_string(),
                is_error: false,
            },
        ));
        let generation = r.generation();
        assert_eq!(r.load_session(&events), ReconcilePlan::FullRebuild);
        assert_eq!(r.generation(), generation + 1);
        assert!(matches!(
            r.find("tc_1"),
            Some(TimelineItem::ToolCall { status: ToolCallStatus::Done, .. })
        ));
    }

    // -- Permissions --

    #[test]
    fn test_permission_in_turn_replaced_in_place() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_text_delta("need to delete");
        r.add_permission_placeholder("p1", "bash", "rm -rf build");
        r.on_text_delta("waiting");
        r.resolve_permission("p1", "bash", PermissionOutcome::Allowed);

        assert_eq!(r.items().len(), 2);
        assert!(matches!(
            &r.items()[1],
            TimelineItem::PermissionResolved { permission_id, .. } if permission_id == "p1"
        ));
        assert_eq!(r.visible_items().count(), 2);
    }

    #[test]
    fn test_permission_outside_turn_appends_marker() {
        let mut r = reducer();
        let events = vec![TraceEvent::new(
            "e1",
            TraceEventKind::Permission {
                permission_id: "p1".to_string(),
                tool: "bash".to_string(),
                summary: "rm".to_string(),
                outcome: None,
            },
        )];
        r.load_session(&events);
        r.resolve_permission("p1", "bash", PermissionOutcome::Denied);

        assert_eq!(r.items().len(), 2);
        assert!(matches!(&r.items()[0], TimelineItem::Permission { .. }));
        assert!(matches!(
            &r.items()[1],
            TimelineItem::PermissionResolved {
                outcome: PermissionOutcome::Denied,
                ..
            }
        ));
        assert!(r.is_dirty());
    }

    // -- Local mutations and memory --

    #[test]
    fn test_generation_bumps_on_local_mutations() {
        let mut r = reducer();
        let g0 = r.generation();
        let id = r.append_system_event("Model changed");
        r.append_error("boom", true);
        r.append_audio_clip("memo", Some(1200));
        assert_eq!(r.generation(), g0 + 3);
        assert!(r.remove_item(&id));
        assert!(!r.remove_item(&id));
        assert_eq!(r.generation(), g0 + 4);
        assert!(matches!(
            &r.items()[0],
            TimelineItem::Error { fatal: true, .. }
        ));
    }

    #[test]
    fn test_streaming_deltas_move_generation() {
        let mut r = reducer();
        let g0 = r.generation();
        r.on_turn_start();
        assert_eq!(r.generation(), g0 + 1);
        r.on_text_delta("hello");
        assert_eq!(r.generation(), g0 + 2);
        r.on_thinking_delta("hmm");
        assert_eq!(r.generation(), g0 + 3);
        r.on_message_end();
        r.on_turn_end();
        assert_eq!(r.generation(), g0 + 5);
        assert!(r.is_dirty());
    }

    #[test]
    fn test_output_after_memory_pressure_extends_preview() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_tool_start("tc_1", "bash", &json!({"command": "tail -f log"}));
        r.on_tool_output("tc_1", "line one\n");
        r.handle_memory_pressure();

        r.on_tool_output("tc_1", "line two\n");
        assert!(r.tool_outputs().full_output("tc_1").is_none());
        assert_eq!(r.tool_outputs().preview("tc_1"), Some("line one\nline two\n"));
        assert!(matches!(
            r.find("tc_1"),
            Some(TimelineItem::ToolCall { output_preview, output_bytes: 18, .. })
                if output_preview == "line one\nline two\n"
        ));
    }

    #[test]
    fn test_output_after_total_cap_eviction_extends_preview() {
        let mut r = TimelineReducer::new(TimelineLimits {
            tool_output_item_bytes: 100,
            tool_output_total_bytes: 25,
            ..TimelineLimits::default()
        });
        r.on_turn_start();
        r.on_tool_start("tc_1", "bash", &json!({}));
        r.on_tool_start("tc_2", "bash", &json!({}));
        r.on_tool_output("tc_1", "aaaaaaaaaa");
        r.on_tool_output("tc_2", "bbbbbbbbbbbbbbbbbbbb");
        assert!(r.tool_outputs().is_evicted("tc_1"));

        r.on_tool_output("tc_1", "cc");
        assert!(r.tool_outputs().full_output("tc_1").is_none());
        assert_eq!(r.tool_outputs().preview("tc_1"), Some("aaaaaaaaaacc"));
        assert_eq!(r.tool_outputs().full_output("tc_2"), Some("bbbbbbbbbbbbbbbbbbbb"));
    }

    #[test]
    fn test_memory_pressure_releases_bodies() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_tool_start("tc_1", "bash", &json!({"command": "cat log"}));
        r.on_tool_output("tc_1", "line one\nline two\n");
        r.on_turn_end();
        assert!(r.set_expanded("tc_1", true));

        let report = r.handle_memory_pressure();
        assert_eq!(report.output_items, 1);
        assert_eq!(report.output_bytes, 18);
        assert_eq!(report.args_items, 1);
        assert_eq!(report.collapsed_items, 1);
        assert!(r.tool_outputs().full_output("tc_1").is_none());
        assert_eq!(r.tool_outputs().preview("tc_1"), Some("line one\nline two\n"));
        assert!(matches!(
            &r.items()[0],
            TimelineItem::ToolCall { expanded: false, output_preview, .. } if !output_preview.is_empty()
        ));
    }

    #[test]
    fn test_apply_full_output() {
        let mut r = reducer();
        r.on_turn_start();
        r.on_tool_start("tc_1", "bash", &json!({}));
        r.on_turn_end();
        assert!(r.apply_full_output("tc_1", "entire body"));
        assert_eq!(r.tool_outputs().full_output("tc_1"), Some("entire body"));
        assert!(!r.apply_full_output("missing", "x"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut r = reducer();
        r.load_session(&trace(2));
        r.append_system_event("x");
        r.reset();
        assert!(r.items().is_empty());
        assert!(r.rendered_trace_ids().is_empty());
        assert!(!r.is_dirty());
    }
}
