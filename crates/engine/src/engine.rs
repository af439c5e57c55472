//! The tool-call engine trait and the types it trades in.
//!
//! An engine sits between the agent loop and a provider's tool-calling
//! convention. Going out, it turns {instructions, tool definitions, history}
//! into a [`ProviderRequest`]. Coming back, it folds streamed chunks into a
//! [`StreamProcessingState`] and finalizes them into a [`ParsedModelResponse`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolwright_core::message::{Message, MessageToolCall};
use toolwright_core::provider::{ProviderRequest, StreamChunk, ToolDefinition};
use toolwright_core::tool::ToolResult;

use crate::ToolCallEngineKind;

/// Everything an engine needs to build one provider request.
#[derive(Debug, Clone)]
pub struct PrepareRequestContext {
    pub model: String,
    /// Full history, system message first.
    pub messages: Vec<Message>,
    /// Tools visible at this step.
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// A natively streamed tool call being assembled from fragments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallAccumulator {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallAccumulator {
    pub fn to_tool_call(&self) -> MessageToolCall {
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: if self.arguments.trim().is_empty() {
                "{}".into()
            } else {
                self.arguments.clone()
            },
        }
    }
}

/// Per-response accumulator. Created when a response starts streaming,
/// mutated once per chunk, consumed by `finalize`.
#[derive(Debug, Clone, Default)]
pub struct StreamProcessingState {
    /// Raw content as received from the provider.
    pub content_buffer: String,
    pub reasoning_buffer: String,
    /// Tool calls assembled or committed so far.
    pub tool_calls: Vec<ToolCallAccumulator>,
    pub finish_reason: Option<String>,
    /// User-visible content already forwarded as deltas.
    pub forwarded_content: String,
    /// Tools the request exposed.
    pub tool_names: Vec<String>,
}

/// Streaming view of a tool call, emitted when the engine learns something new.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallUpdate {
    pub tool_call_id: String,
    pub name: String,
    pub arguments_delta: String,
    pub is_complete: bool,
}

/// What one chunk contributed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutcome {
    /// User-visible content delta.
    pub content: String,
    /// Reasoning delta.
    pub reasoning_content: String,
    pub tool_calls: Vec<ToolCallUpdate>,
    pub has_tool_call_update: bool,
}

/// Normalized model output, identical in shape for every engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedModelResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,
    pub finish_reason: String,
}

impl ParsedModelResponse {
    /// A response with text only; the fallback for unrecoverable buffers.
    pub fn content_only(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning_content: None,
            tool_calls: Vec::new(),
            finish_reason: "stop".into(),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The buffer cannot be turned into a response. The loop degrades the
    /// turn to content-only.
    #[error("Unrecoverable model output: {0}")]
    Unrecoverable(String),

    #[error("Unknown tool-call engine: {0}")]
    UnknownKind(String),
}

/// One provider tool-calling convention.
///
/// Implementations must never panic or fail in `process_chunk`, whatever the
/// input looks like, and must never drop accumulated tool-call fragments.
pub trait ToolCallEngine: Send + Sync {
    fn kind(&self) -> ToolCallEngineKind;

    /// Augment the base instructions with whatever the convention needs.
    fn prepare_system_prompt(&self, base_instructions: &str, tools: &[ToolDefinition]) -> String;

    fn prepare_request(&self, context: PrepareRequestContext) -> ProviderRequest;

    fn init_stream_state(&self, tools: &[ToolDefinition]) -> StreamProcessingState {
        StreamProcessingState {
            tool_names: tools.iter().map(|tool| tool.name.clone()).collect(),
            ..StreamProcessingState::default()
        }
    }

    fn process_chunk(&self, chunk: &StreamChunk, state: &mut StreamProcessingState) -> ChunkOutcome;

    fn finalize(&self, state: StreamProcessingState) -> Result<ParsedModelResponse, EngineError>;

    /// Serialize a finalized turn back into history.
    fn build_assistant_message(&self, response: &ParsedModelResponse) -> Message;

    /// Serialize the results of a turn's tool calls into history.
    fn build_tool_result_messages(&self, results: &[ToolResult]) -> Vec<Message>;
}

/// Bookkeeping shared by every engine: reasoning deltas and finish reason.
pub(crate) fn absorb_common(
    chunk: &StreamChunk,
    state: &mut StreamProcessingState,
    outcome: &mut ChunkOutcome,
) {
    if let Some(reasoning) = chunk.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
        state.reasoning_buffer.push_str(reasoning);
        outcome.reasoning_content.push_str(reasoning);
    }
    if let Some(reason) = &chunk.finish_reason {
        state.finish_reason = Some(reason.clone());
    }
}

/// Forward only the part of `visible` not yet sent.
///
/// If the visible text no longer extends what was forwarded (a re-parse
/// changed earlier text), nothing is forwarded; the final message is
/// authoritative.
pub(crate) fn forward_visible(visible: &str, state: &mut StreamProcessingState) -> String {
    match visible.strip_prefix(state.forwarded_content.as_str()) {
        Some(delta) if !delta.is_empty() => {
            let delta = delta.to_string();
            state.forwarded_content = visible.to_string();
            delta
        }
        _ => String::new(),
    }
}

pub(crate) fn finish_reason_for(state_reason: Option<String>, has_tool_calls: bool) -> String {
    if has_tool_calls {
        "tool_calls".into()
    } else {
        state_reason.unwrap_or_else(|| "stop".into())
    }
}

/// Tool results as plain user-side text, for engines whose providers have
/// no tool role.
pub(crate) fn tool_results_as_user_messages(results: &[ToolResult]) -> Vec<Message> {
    results
        .iter()
        .map(|r| {
            Message::user(format!(
                "Tool: {}\nCall ID: {}\nResult:\n{}",
                r.name,
                r.tool_call_id,
                r.content_text()
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_visible_emits_only_new_suffix() {
        let mut state = StreamProcessingState::default();
        assert_eq!(forward_visible("he", &mut state), "he");
        assert_eq!(forward_visible("hello", &mut state), "llo");
        assert_eq!(forward_visible("hello", &mut state), "");
        // Diverging text is not re-sent.
        assert_eq!(forward_visible("help", &mut state), "");
        assert_eq!(state.forwarded_content, "hello");
    }

    #[test]
    fn accumulator_defaults_empty_arguments() {
        let acc = ToolCallAccumulator {
            index: 0,
            id: "c1".into(),
            name: "screenshot".into(),
            arguments: String::new(),
        };
        assert_eq!(acc.to_tool_call().arguments, "{}");
    }

    #[test]
    fn finish_reason_prefers_tool_calls() {
        assert_eq!(finish_reason_for(Some("stop".into()), true), "tool_calls");
        assert_eq!(finish_reason_for(Some("length".into()), false), "length");
        assert_eq!(finish_reason_for(None, false), "stop");
    }

    #[test]
    fn tool_results_render_errors() {
        let messages = tool_results_as_user_messages(&[ToolResult::failure(
            "c1", "click", "element not found", 4,
        )]);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("Tool: click"));
        assert!(messages[0].content.contains("Error: element not found"));
    }
}
