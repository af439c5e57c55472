//! Native function calling: tool definitions travel as request metadata and
//! tool calls come back as structured, index-keyed deltas.

use toolwright_core::message::{Message, MessageToolCall};
use toolwright_core::provider::{ProviderRequest, StreamChunk, ToolCallDelta, ToolDefinition};
use toolwright_core::tool::ToolResult;
use tracing::warn;

use crate::ToolCallEngineKind;
use crate::engine::{
    ChunkOutcome, EngineError, ParsedModelResponse, PrepareRequestContext, StreamProcessingState,
    ToolCallAccumulator, ToolCallEngine, ToolCallUpdate, absorb_common, finish_reason_for,
};

#[derive(Debug, Clone, Default)]
pub struct NativeEngine;

impl NativeEngine {
    pub fn new() -> Self {
        Self
    }

    fn accumulate(delta: &ToolCallDelta, state: &mut StreamProcessingState) -> ToolCallUpdate {
        let pos = match state.tool_calls.iter().position(|a| a.index == delta.index) {
            Some(pos) => pos,
            None => {
                let id = delta
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(MessageToolCall::generate_id);
                state.tool_calls.push(ToolCallAccumulator {
                    index: delta.index,
                    id,
                    ..Default::default()
                });
                state.tool_calls.len() - 1
            }
        };
        let acc = &mut state.tool_calls[pos];

        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            // Some providers repeat the full name on every delta, others split it.
            if acc.name.is_empty() {
                acc.name = name.to_string();
            } else if acc.name != name {
                acc.name.push_str(name);
            }
        }
        let arguments_delta = delta.arguments.clone().unwrap_or_default();
        acc.arguments.push_str(&arguments_delta);

        ToolCallUpdate {
            tool_call_id: acc.id.clone(),
            name: acc.name.clone(),
            arguments_delta,
            is_complete: false,
        }
    }
}

impl ToolCallEngine for NativeEngine {
    fn kind(&self) -> ToolCallEngineKind {
        ToolCallEngineKind::Native
    }

    fn prepare_system_prompt(&self, base_instructions: &str, _tools: &[ToolDefinition]) -> String {
        base_instructions.to_string()
    }

    fn prepare_request(&self, context: PrepareRequestContext) -> ProviderRequest {
        ProviderRequest {
            model: context.model,
            messages: context.messages,
            temperature: context.temperature,
            max_tokens: context.max_tokens,
            tools: context.tools,
            response_format: None,
            stream: true,
            stop: vec![],
        }
    }

    fn process_chunk(&self, chunk: &StreamChunk, state: &mut StreamProcessingState) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        absorb_common(chunk, state, &mut outcome);

        if let Some(content) = chunk.content.as_deref().filter(|c| !c.is_empty()) {
            state.content_buffer.push_str(content);
            state.forwarded_content.push_str(content);
            outcome.content.push_str(content);
        }

        for delta in &chunk.tool_calls {
            outcome.tool_calls.push(Self::accumulate(delta, state));
            outcome.has_tool_call_update = true;
        }

        outcome
    }

    fn finalize(&self, mut state: StreamProcessingState) -> Result<ParsedModelResponse, EngineError> {
        state.tool_calls.sort_by_key(|a| a.index);
        let tool_calls: Vec<MessageToolCall> = state
            .tool_calls
            .iter()
            .filter(|acc| {
                if acc.name.is_empty() {
                    warn!(tool_call_id = %acc.id, "Dropping streamed tool call with no name");
                    return false;
                }
                true
            })
            .map(ToolCallAccumulator::to_tool_call)
            .collect();

        let reasoning = (!state.reasoning_buffer.is_empty()).then_some(state.reasoning_buffer);
        let finish_reason = finish_reason_for(state.finish_reason, !tool_calls.is_empty());

        Ok(ParsedModelResponse {
            content: state.content_buffer,
            reasoning_content: reasoning,
            tool_calls,
            finish_reason,
        })
    }

    fn build_assistant_message(&self, response: &ParsedModelResponse) -> Message {
        Message::assistant_with_tool_calls(response.content.clone(), response.tool_calls.clone())
    }

    fn build_tool_result_messages(&self, results: &[ToolResult]) -> Vec<Message> {
        results
            .iter()
            .map(|r| Message::tool_result(r.tool_call_id.clone(), r.content_text()))
            .collect()
    }
}
