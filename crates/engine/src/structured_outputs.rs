//! Structured-output tool calling for providers without native function
//! calling but with JSON-schema constrained output.
//!
//! The model answers each turn with one JSON object:
//!
//! ```json
//! {"content": "text for the user", "toolCall": {"name": "tool", "args": {}}}
//! ```
//!
//! While streaming, only the `content` string is forwarded. The surrounding
//! JSON scaffold never reaches the user.

use serde_json::{Map, Value, json};
use toolwright_core::message::{Message, MessageToolCall};
use toolwright_core::provider::{ProviderRequest, StreamChunk, ToolDefinition};
use toolwright_core::tool::ToolResult;
use tracing::debug;

use crate::ToolCallEngineKind;
use crate::engine::{
    ChunkOutcome, EngineError, ParsedModelResponse, PrepareRequestContext, StreamProcessingState,
    ToolCallAccumulator, ToolCallEngine, ToolCallUpdate, absorb_common, finish_reason_for,
    forward_visible, tool_results_as_user_messages,
};
use crate::json_scan::{parse_outermost_object, partial_string_field};

const CONTENT_KEY: &str = "content";
const TOOL_CALL_KEY: &str = "toolCall";

#[derive(Debug, Clone, Default)]
pub struct StructuredOutputsEngine;

impl StructuredOutputsEngine {
    pub fn new() -> Self {
        Self
    }

    /// JSON schema the provider should constrain output to.
    pub fn response_schema(tools: &[ToolDefinition]) -> Value {
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let mut properties = json!({
            CONTENT_KEY: {
                "type": "string",
                "description": "Message for the user. Explain what you are doing or give the final answer."
            }
        });
        if !names.is_empty() {
            properties[TOOL_CALL_KEY] = json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "enum": names },
                    "args": { "type": "object" }
                },
                "required": ["name", "args"]
            });
        }
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": "agent_step",
                "strict": false,
                "schema": {
                    "type": "object",
                    "properties": properties,
                    "required": [CONTENT_KEY]
                }
            }
        })
    }

    /// Text the user should see, given everything buffered so far.
    fn visible_content(buffer: &str, parsed: Option<&Map<String, Value>>) -> String {
        if let Some(map) = parsed {
            return map
                .get(CONTENT_KEY)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
        }
        if is_free_text(buffer) {
            return buffer.trim_start().to_string();
        }
        partial_string_field(buffer, CONTENT_KEY).unwrap_or_default()
    }

    /// Pull a complete `toolCall` out of a parsed object.
    fn extract_tool_call(map: &Map<String, Value>) -> Option<(String, String)> {
        let call = map.get(TOOL_CALL_KEY)?.as_object()?;
        let name = call.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }
        let arguments = match call.get("args").or_else(|| call.get("arguments")) {
            None | Some(Value::Null) => "{}".to_string(),
            // Some models double-encode the arguments.
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(value @ Value::Object(_)) => value.to_string(),
                _ => json!({ "input": raw }).to_string(),
            },
            Some(other) => other.to_string(),
        };
        Some((name.to_string(), arguments))
    }
}

/// A buffer that doesn't open with `{` or a code fence is plain text: the
/// model ignored the output format.
fn is_free_text(buffer: &str) -> bool {
    let trimmed = buffer.trim_start();
    !trimmed.is_empty() && !trimmed.starts_with('{') && !trimmed.starts_with('`')
}

fn tool_list(tools: &[ToolDefinition]) -> String {
    tools
        .iter()
        .map(|t| {
            let schema = serde_json::to_string_pretty(&t.parameters).unwrap_or_else(|_| "{}".into());
            format!(
                "## {}\nDescription: {}\nParameters JSON Schema:\n```json\n{}\n```",
                t.name, t.description, schema
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl ToolCallEngine for StructuredOutputsEngine {
    fn kind(&self) -> ToolCallEngineKind {
        ToolCallEngineKind::StructuredOutputs
    }

    fn prepare_system_prompt(&self, base_instructions: &str, tools: &[ToolDefinition]) -> String {
        if tools.is_empty() {
            return format!(
                "{base_instructions}\n\n<output_format>\nAlways reply with a single JSON object: \
                 {{\"content\": \"<your reply>\"}}. Do not wrap it in markdown.\n</output_format>"
            );
        }
        format!(
            "{base_instructions}\n\n<tool_instruction>\nYou have access to the following tools:\n\n{}\n\n\
             Reply with exactly one JSON object per turn:\n\
             {{\"content\": \"<message for the user>\", \"toolCall\": {{\"name\": \"<tool name>\", \"args\": {{}}}}}}\n\
             Include \"toolCall\" only when you need a tool, and call at most one tool per turn. \
             When the task is done, reply with \"content\" alone. Do not wrap the JSON in markdown.\n\
             </tool_instruction>",
            tool_list(tools)
        )
    }

    fn prepare_request(&self, context: PrepareRequestContext) -> ProviderRequest {
        let response_format = Self::response_schema(&context.tools);
        ProviderRequest {
            model: context.model,
            messages: context.messages,
            temperature: context.temperature,
            max_tokens: context.max_tokens,
            tools: vec![],
            response_format: Some(response_format),
            stream: true,
            stop: vec![],
        }
    }

    fn process_chunk(&self, chunk: &StreamChunk, state: &mut StreamProcessingState) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        absorb_common(chunk, state, &mut outcome);

        let Some(content) = chunk.content.as_deref().filter(|c| !c.is_empty()) else {
            return outcome;
        };
        state.content_buffer.push_str(content);

        let parsed = parse_outermost_object(&state.content_buffer);
        let visible = Self::visible_content(&state.content_buffer, parsed.as_ref());
        outcome.content = forward_visible(&visible, state);

        // Commit the call once, the first time the object parses completely.
        if state.tool_calls.is_empty()
            && let Some((name, arguments)) = parsed.as_ref().and_then(Self::extract_tool_call)
        {
            let id = MessageToolCall::generate_id();
            debug!(tool = %name, "Structured tool call committed");
            state.tool_calls.push(ToolCallAccumulator {
                index: 0,
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            });
            outcome.tool_calls.push(ToolCallUpdate {
                tool_call_id: id,
                name,
                arguments_delta: arguments,
                is_complete: true,
            });
            outcome.has_tool_call_update = true;
        }

        outcome
    }

    fn finalize(&self, state: StreamProcessingState) -> Result<ParsedModelResponse, EngineError> {
        let buffer = state.content_buffer;
        let parsed = parse_outermost_object(&buffer);

        let content = match &parsed {
            Some(map) => Self::visible_content(&buffer, Some(map)),
            None if is_free_text(&buffer) => buffer.trim().to_string(),
            None => {
                debug!("Structured output did not parse; falling back to raw text");
                partial_string_field(&buffer, CONTENT_KEY).unwrap_or_else(|| buffer.trim().to_string())
            }
        };

        let mut tool_calls: Vec<MessageToolCall> =
            state.tool_calls.iter().map(ToolCallAccumulator::to_tool_call).collect();
        if tool_calls.is_empty()
            && let Some((name, arguments)) = parsed.as_ref().and_then(Self::extract_tool_call)
        {
            tool_calls.push(MessageToolCall {
                id: MessageToolCall::generate_id(),
                name,
                arguments,
            });
        }

        let reasoning = (!state.reasoning_buffer.is_empty()).then_some(state.reasoning_buffer);
        let finish_reason = finish_reason_for(state.finish_reason, !tool_calls.is_empty());
        Ok(ParsedModelResponse {
            content,
            reasoning_content: reasoning,
            tool_calls,
            finish_reason,
        })
    }

    fn build_assistant_message(&self, response: &ParsedModelResponse) -> Message {
        let mut body = Map::new();
        body.insert(CONTENT_KEY.into(), Value::String(response.content.clone()));
        if let Some(call) = response.tool_calls.first() {
            let args = serde_json::from_str::<Value>(&call.arguments).unwrap_or_else(|_| json!({}));
            body.insert(TOOL_CALL_KEY.into(), json!({ "name": call.name, "args": args }));
        }
        Message::assistant(Value::Object(body).to_string())
    }

    fn build_tool_result_messages(&self, results: &[ToolResult]) -> Vec<Message> {
        tool_results_as_user_messages(results)
    }
}
