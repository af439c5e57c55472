//! Fold the event log into provider messages.
//!
//! The log is the single source of truth: every request is rebuilt from it,
//! serialized through the active engine so the history matches the
//! convention the model is being asked to follow.

use std::collections::HashSet;

use toolwright_core::event::{Event, EventKind};
use toolwright_core::message::Message;
use toolwright_core::tool::ToolResult;
use toolwright_engine::{ParsedModelResponse, ToolCallEngine};
use tracing::debug;

/// Shown to the model for calls whose result never made it into the log.
pub const MISSING_RESULT: &str = "No result recorded (run interrupted)";

/// Build the conversation history (without the system message).
///
/// Streaming deltas, plan and lifecycle events are skipped. Results whose
/// call is not in the log are dropped; calls without a result get a
/// synthesized failure so every call is answered.
pub fn build_history(events: &[Event], engine: &dyn ToolCallEngine) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut pending = Pending::default();

    for event in events {
        match &event.kind {
            EventKind::UserMessage { content } => {
                pending.flush(engine, &mut messages);
                messages.push(Message::user(content.clone()));
            }
            EventKind::EnvironmentInput { content, .. } => {
                pending.flush(engine, &mut messages);
                messages.push(Message::user(content.clone()));
            }
            EventKind::AssistantMessage {
                content,
                reasoning_content,
                tool_calls,
                finish_reason,
                ..
            } => {
                pending.flush(engine, &mut messages);
                let response = ParsedModelResponse {
                    content: content.clone(),
                    reasoning_content: reasoning_content.clone(),
                    tool_calls: tool_calls.clone(),
                    finish_reason: finish_reason.clone(),
                };
                messages.push(engine.build_assistant_message(&response));
                pending.open = tool_calls
                    .iter()
                    .map(|tc| (tc.id.clone(), tc.name.clone()))
                    .collect();
            }
            EventKind::ToolResult {
                tool_call_id,
                name,
                content,
                error,
                elapsed_ms,
            } => {
                if !pending.answer(tool_call_id) {
                    debug!(tool_call_id = %tool_call_id, "Skipping tool result without a matching call");
                    continue;
                }
                pending.results.push(ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    name: name.clone(),
                    content: content.clone(),
                    error: error.clone(),
                    elapsed_ms: *elapsed_ms,
                });
            }
            _ => {}
        }
    }
    pending.flush(engine, &mut messages);
    messages
}

/// Tool calls of the latest assistant message and the results gathered for
/// them so far.
#[derive(Default)]
struct Pending {
    open: Vec<(String, String)>,
    answered: HashSet<String>,
    results: Vec<ToolResult>,
}

impl Pending {
    fn answer(&mut self, tool_call_id: &str) -> bool {
        let known = self.open.iter().any(|(id, _)| id == tool_call_id);
        known && self.answered.insert(tool_call_id.to_string())
    }

    fn flush(&mut self, engine: &dyn ToolCallEngine, messages: &mut Vec<Message>) {
        for (id, name) in &self.open {
            if !self.answered.contains(id) {
                self.results
                    .push(ToolResult::failure(id.clone(), name.clone(), MISSING_RESULT, 0));
            }
        }
        if !self.results.is_empty() {
            messages.extend(engine.build_tool_result_messages(&self.results));
        }
        *self = Self::default();
    }
}
