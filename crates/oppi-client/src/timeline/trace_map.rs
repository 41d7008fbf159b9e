//! Map trace events to timeline items.

use chrono::{DateTime, Utc};
use oppi_protocol::{AssistantBlock, TraceEvent, TraceEventKind};
use serde_json::Value;

use super::{PermissionOutcome, TimelineItem, ToolCallStatus};
use crate::stores::tool_output::truncate_at_char_boundary;
use crate::stores::{ToolArgsStore, ToolOutputStore};

const ARGS_SUMMARY_BYTES: usize = 160;

/// A suffix event would modify an item that is already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TouchesPrior {
    pub event_id: String,
    pub item_id: String,
}

pub(crate) struct TraceMapper<'a> {
    pub outputs: &'a mut ToolOutputStore,
    pub args: &'a mut ToolArgsStore,
}

impl TraceMapper<'_> {
    /// Map `events` into items that follow `prior`.
    ///
    /// Fails when an event needs to change one of the `prior` items, e.g. a
    /// tool result for a call rendered by an earlier snapshot.
    pub fn map(
        &mut self,
        events: &[TraceEvent],
        prior: &[TimelineItem],
    ) -> Result<Vec<TimelineItem>, TouchesPrior> {
        let mut items: Vec<TimelineItem> = Vec::new();
        for event in events {
            let timestamp = event.timestamp.and_then(DateTime::<Utc>::from_timestamp_millis);
            match &event.kind {
                TraceEventKind::User { text, image_count } => {
                    items.push(TimelineItem::UserMessage {
                        id: event.id.clone(),
                        text: text.clone(),
                        image_count: *image_count,
                        timestamp,
                    });
                }
                TraceEventKind::Assistant { content } => {
                    self.map_assistant(&event.id, content, timestamp, &mut items);
                }
                TraceEventKind::ToolResult {
                    tool_call_id,
                    output,
                    is_error,
                } => {
                    if prior.iter().any(|item| is_tool_call(item, tool_call_id)) {
                        return Err(TouchesPrior {
                            event_id: event.id.clone(),
                            item_id: tool_call_id.clone(),
                        });
                    }
                    self.apply_tool_result(tool_call_id, output, *is_error, &mut items);
                }
                TraceEventKind::Permission {
                    permission_id,
                    tool,
                    summary,
                    outcome,
                } => {
                    let resolved = outcome.as_deref().and_then(PermissionOutcome::parse);
                    items.push(match resolved {
                        Some(outcome) => TimelineItem::PermissionResolved {
                            id: event.id.clone(),
                            permission_id: permission_id.clone(),
                            tool: tool.clone(),
                            outcome,
                        },
                        None => TimelineItem::Permission {
                            id: event.id.clone(),
                            tool: tool.clone(),
                            summary: summary.clone(),
                        },
                    });
                }
                TraceEventKind::System { message } => {
                    items.push(TimelineItem::SystemEvent {
                        id: event.id.clone(),
                        message: message.clone(),
                    });
                }
                TraceEventKind::Error { message, fatal } => {
                    items.push(TimelineItem::Error {
                        id: event.id.clone(),
                        message: message.clone(),
                        fatal: *fatal,
                    });
                }
                TraceEventKind::Compaction {
                    tokens_before,
                    summary,
                } => {
                    items.push(TimelineItem::SystemEvent {
                        id: event.id.clone(),
                        message: compaction_message(*tokens_before, summary.as_deref()),
                    });
                }
                TraceEventKind::Audio { title, duration_ms } => {
                    items.push(TimelineItem::AudioClip {
                        id: event.id.clone(),
                        title: title.clone(),
                        duration_ms: *duration_ms,
                    });
                }
                TraceEventKind::Unknown => {}
            }
        }
        Ok(items)
    }

    fn map_assistant(
        &mut self,
        event_id: &str,
        content: &[AssistantBlock],
        timestamp: Option<DateTime<Utc>>,
        items: &mut Vec<TimelineItem>,
    ) {
        let mut text_index = 0;
        let mut thinking_index = 0;
        for block in content {
            match block {
                AssistantBlock::Text { text } => {
                    let id = format!("{event_id}-text-{text_index}");
                    text_index += 1;
                    if text.trim().is_empty() {
                        continue;
                    }
                    items.push(TimelineItem::AssistantMessage {
                        id,
                        text: text.clone(),
                        timestamp,
                    });
                }
                AssistantBlock::Thinking { thinking } => {
                    let id = format!("{event_id}-thinking-{thinking_index}");
                    thinking_index += 1;
                    if thinking.trim().is_empty() {
                        continue;
                    }
                    items.push(TimelineItem::Thinking {
                        id,
                        text: thinking.clone(),
                    });
                }
                AssistantBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    self.args.insert(id, arguments);
                    items.push(new_tool_call(id, name, arguments));
                }
            }
        }
    }

    fn apply_tool_result(
        &mut self,
        tool_call_id: &str,
        output: &str,
        is_error: bool,
        items: &mut [TimelineItem],
    ) {
        let Some(item) = items
            .iter_mut()
            .rev()
            .find(|item| is_tool_call(item, tool_call_id))
        else {
            log::debug!("tool result for unknown call {tool_call_id}");
            return;
        };
        self.outputs.set(tool_call_id, output);
        if let TimelineItem::ToolCall {
            output_preview,
            output_bytes,
            truncated,
            status,
            is_error: item_error,
            ..
        } = item
        {
            *output_preview = self.outputs.preview(tool_call_id).unwrap_or_default().to_string();
            *output_bytes = output.len();
            *truncated = self.outputs.is_truncated(tool_call_id);
            *status = ToolCallStatus::Done;
            *item_error = is_error;
        }
    }
}

pub(crate) fn is_tool_call(item: &TimelineItem, tool_call_id: &str) -> bool {
    matches!(item, TimelineItem::ToolCall { id, .. } if id == tool_call_id)
}

pub(crate) fn new_tool_call(id: &str, tool: &str, args: &Value) -> TimelineItem {
    TimelineItem::ToolCall {
        id: id.to_string(),
        tool: tool.to_string(),
        args_summary: summarize_args(args),
        output_preview: String::new(),
        output_bytes: 0,
        truncated: false,
        status: ToolCallStatus::Running,
        is_error: false,
        expanded: false,
    }
}

/// One-line description of tool arguments.
pub(crate) fn summarize_args(args: &Value) -> String {
    for key in ["command", "path", "file_path", "pattern", "url"] {
        if let Some(value) = args.get(key).and_then(Value::as_str) {
            return truncate_at_char_boundary(value, ARGS_SUMMARY_BYTES).to_string();
        }
    }
    match args {
        Value::Null => String::new(),
        other => {
            let compact = other.to_string();
            truncate_at_char_boundary(&compact, ARGS_SUMMARY_BYTES).to_string()
        }
    }
}

pub(crate) fn compaction_message(tokens_before: Option<u64>, summary: Option<&str>) -> String {
    let mut message = match tokens_before {
        Some(tokens) => format!("Context compacted ({tokens} tokens before)"),
        None => "Context compacted".to_string(),
    };
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        message.push_str(": ");
        message.push_str(summary);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stores() -> (ToolOutputStore, ToolArgsStore) {
        (
            ToolOutputStore::new(64 * 1024, 1024 * 1024),
            ToolArgsStore::new(64 * 1024, 1024 * 1024),
        )
    }

    fn assistant(id: &str, content: Vec<AssistantBlock>) -> TraceEvent {
        TraceEvent::new(id, TraceEventKind::Assistant { content })
    }

    #[test]
    fn test_assistant_split_ids() {
        let (mut outputs, mut args) = stores();
        let mut mapper = TraceMapper {
            outputs: &mut outputs,
            args: &mut args,
        };
        let events = vec![assistant(
            "e2",
            vec![
                AssistantBlock::Thinking {
                    thinking: "plan".to_string(),
                },
                AssistantBlock::Text {
                    text: "Looking.".to_string(),
                },
                AssistantBlock::ToolCall {
                    id: "tc_1".to_string(),
                    name: "read".to_string(),
                    arguments: json!({"path": "a.rs"}),
                },
                AssistantBlock::Text {
                    text: "  ".to_string(),
                },
                AssistantBlock::Text {
                    text: "Done.".to_string(),
                },
            ],
        )];
        let items = mapper.map(&events, &[]).unwrap();
        let ids: Vec<&str> = items.iter().map(TimelineItem::id).collect();
        assert_eq!(ids, vec!["e2-thinking-0", "e2-text-0", "tc_1", "e2-text-2"]);
        assert!(matches!(&items[2], TimelineItem::ToolCall { args_summary, .. } if args_summary == "a.rs"));
        assert_eq!(args.get("tc_1"), Some(&json!({"path": "a.rs"})));
    }

    #[test]
    fn test_tool_result_updates_call() {
        let (mut outputs, mut args) = stores();
        let mut mapper = TraceMapper {
            outputs: &mut outputs,
            args: &mut args,
        };
        let events = vec![
            assistant(
                "e1",
                vec![AssistantBlock::ToolCall {
                    id: "tc_1".to_string(),
                    name: "bash".to_string(),
                    arguments: json!({"command": "ls"}),
                }],
            ),
            TraceEvent::new(
                "e2",
                TraceEventKind::ToolResult {
                    tool_call_id: "tc_1".to_string(),
                    output: "Cargo.toml\nsrc".to_string(),
                    is_error: false,
                },
            ),
        ];
        let items = mapper.map(&events, &[]).unwrap();
        assert_eq!(items.len(), 1);
        match &items[0] {
            TimelineItem::ToolCall {
                status,
                output_preview,
                ..
            } => {
                assert_eq!(*status, ToolCallStatus::Done);
                assert_eq!(output_preview, "Cargo.toml\nsrc");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_result_for_prior_item_fails() {
        let (mut outputs, mut args) = stores();
        let mut mapper = TraceMapper {
            outputs: &mut outputs,
            args: &mut args,
        };
        let prior = vec![new_tool_call("tc_1", "bash", &json!({"command": "ls"}))];
        let events = vec![TraceEvent::new(
            "e5",
            TraceEventKind::ToolResult {
                tool_call_id: "tc_1".to_string(),
                output: "ok".to_string(),
                is_error: false,
            },
        )];
        let err = mapper.map(&events, &prior).unwrap_err();
        assert_eq!(err.item_id, "tc_1");
    }

    #[test]
    fn test_pending_permission_is_hidden_placeholder() {
        let (mut outputs, mut args) = stores();
        let mut mapper = TraceMapper {
            outputs: &mut outputs,
            args: &mut args,
        };
        let events = vec![
            TraceEvent::new(
                "e1",
                TraceEventKind::Permission {
                    permission_id: "p1".to_string(),
                    tool: "bash".to_string(),
                    summary: "rm".to_string(),
                    outcome: None,
                },
            ),
            TraceEvent::new(
                "e2",
                TraceEventKind::Permission {
                    permission_id: "p0".to_string(),
                    tool: "write".to_string(),
                    summary: String::new(),
                    outcome: Some("denied".to_string()),
                },
            ),
            TraceEvent::new("e3", TraceEventKind::Unknown),
        ];
        let items = mapper.map(&events, &[]).unwrap();
        assert_eq!(items.len(), 2);
        assert!(!items[0].is_visible());
        assert!(matches!(
            &items[1],
            TimelineItem::PermissionResolved {
                outcome: PermissionOutcome::Denied,
                ..
            }
        ));
    }

    #[test]
    fn test_summarize_args() {
        assert_eq!(summarize_args(&json!({"command": "cargo test"})), "cargo test");
        assert_eq!(summarize_args(&Value::Null), "");
        assert_eq!(summarize_args(&json!({"n": 1})), "{\"n\":1}");
    }
}
