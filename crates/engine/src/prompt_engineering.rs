//! Text-marker tool calling for models with neither native function calling
//! nor structured output.
//!
//! The model is shown an action space in its instructions and replies with
//! prose followed by action lines:
//!
//! ```text
//! Thought: The login button is at the top right.
//! Action: click(start_box='<point>892 351</point>')
//! ```

use serde_json::{Map, Value};
use toolwright_core::message::{Message, MessageToolCall};
use toolwright_core::provider::{ProviderRequest, StreamChunk, ToolDefinition};
use toolwright_core::tool::ToolResult;
use tracing::{debug, warn};

use crate::ToolCallEngineKind;
use crate::action_parser::{
    BareCalls, MarkerSpan, ParsedAction, ScaleFactors, action_segments, encode_escapes,
    find_markers, parse_action, parse_action_strict,
};
use crate::engine::{
    ChunkOutcome, EngineError, ParsedModelResponse, PrepareRequestContext, StreamProcessingState,
    ToolCallAccumulator, ToolCallEngine, ToolCallUpdate, absorb_common, finish_reason_for,
    forward_visible, tool_results_as_user_messages,
};

const THOUGHT_LABEL: &str = "Thought:";
const ACTION_LABEL: &str = "Action:";

#[derive(Debug, Clone, Default)]
pub struct PromptEngineeringEngine {
    factors: ScaleFactors,
}

impl PromptEngineeringEngine {
    pub fn new(factors: ScaleFactors) -> Self {
        Self { factors }
    }

    pub fn factors(&self) -> ScaleFactors {
        self.factors
    }

    fn commit(action: ParsedAction, index: usize, state: &mut StreamProcessingState) -> ToolCallUpdate {
        let id = MessageToolCall::generate_id();
        let arguments = arguments_json(&action);
        debug!(tool = %action.action_type, "Action marker committed");
        state.tool_calls.push(ToolCallAccumulator {
            index: index as u32,
            id: id.clone(),
            name: action.action_type.clone(),
            arguments: arguments.clone(),
        });
        ToolCallUpdate {
            tool_call_id: id,
            name: action.action_type,
            arguments_delta: arguments,
            is_complete: true,
        }
    }
}

fn arguments_json(action: &ParsedAction) -> String {
    let map: Map<String, Value> = action
        .action_inputs
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map).to_string()
}

fn is_identifier_like(text: &str) -> bool {
    text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Whether an unfinished last line could still turn into an action marker.
fn could_become_marker(line: &str, tool_names: &[String]) -> bool {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return false;
    }
    ACTION_LABEL.starts_with(trimmed)
        || trimmed
            .strip_prefix(ACTION_LABEL)
            .is_some_and(|rest| is_identifier_like(rest.trim_start()))
        || (is_identifier_like(trimmed) && tool_names.iter().any(|name| name.starts_with(trimmed)))
}

/// Prose before the first marker, minus a leading `Thought:` label. While
/// streaming, a trailing line that may still become a marker is held back.
fn visible_prose(buffer: &str, markers: &[MarkerSpan], tool_names: &[String], is_final: bool) -> String {
    let mut end = markers.first().map_or(buffer.len(), |m| m.line_start);
    if !is_final && markers.is_empty() {
        let line_start = buffer.rfind('\n').map_or(0, |i| i + 1);
        if could_become_marker(&buffer[line_start..], tool_names) {
            end = line_start;
        }
    }
    let prose = buffer[..end].trim_start();
    let prose = prose.strip_prefix(THOUGHT_LABEL).map_or(prose, str::trim_start);
    let prose = prose.strip_suffix(ACTION_LABEL).unwrap_or(prose);
    if is_final {
        prose.trim().to_string()
    } else {
        prose.to_string()
    }
}

fn format_call(call: &MessageToolCall) -> String {
    let params = match serde_json::from_str::<Value>(&call.arguments) {
        Ok(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}='{}'", encode_escapes(s)),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    };
    format!("{}({})", call.name, params)
}

fn action_signature(tool: &ToolDefinition) -> String {
    let params = tool
        .parameters
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .map(|(name, schema)| {
                    let ty = schema.get("type").and_then(Value::as_str).unwrap_or("value");
                    format!("{name}='<{ty}>'")
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    format!("{}({})  # {}", tool.name, params, tool.description)
}

impl ToolCallEngine for PromptEngineeringEngine {
    fn kind(&self) -> ToolCallEngineKind {
        ToolCallEngineKind::PromptEngineering
    }

    fn prepare_system_prompt(&self, base_instructions: &str, tools: &[ToolDefinition]) -> String {
        if tools.is_empty() {
            return base_instructions.to_string();
        }
        let actions = tools.iter().map(action_signature).collect::<Vec<_>>().join("\n");
        format!(
            "{base_instructions}\n\n## Output Format\n```\nThought: ...\nAction: ...\n```\n\n\
             ## Action Space\n{actions}\n\n\
             ## Note\n\
             - Put each action on its own line after `Action:`. Several actions run in order.\n\
             - Quote parameter values with single quotes and escape line breaks as \\n.\n\
             - Omit the `Action:` line when you give the final answer."
        )
    }

    fn prepare_request(&self, context: PrepareRequestContext) -> ProviderRequest {
        ProviderRequest {
            model: context.model,
            messages: context.messages,
            temperature: context.temperature,
            max_tokens: context.max_tokens,
            tools: vec![],
            response_format: None,
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

        let buffer = state.content_buffer.clone();
        // Unlabelled lines only count as actions when they call a visible tool.
        let bare = BareCalls::Known(&state.tool_names);
        let markers = find_markers(&buffer, bare);
        let visible = visible_prose(&buffer, &markers, &state.tool_names, false);
        let segments = action_segments(&buffer, bare);
        outcome.content = forward_visible(&visible, state);

        // Earlier segments are closed off by the next marker; the last one
        // only commits once it is well formed.
        let last = segments.len().saturating_sub(1);
        for (i, segment) in segments.iter().enumerate().skip(state.tool_calls.len()) {
            let parsed = if i == last {
                parse_action_strict(segment, &self.factors)
            } else {
                parse_action(segment, &self.factors)
            };
            let Some(action) = parsed else {
                break;
            };
            outcome.tool_calls.push(Self::commit(action, i, state));
            outcome.has_tool_call_update = true;
        }

        outcome
    }

    fn finalize(&self, state: StreamProcessingState) -> Result<ParsedModelResponse, EngineError> {
        let buffer = state.content_buffer;
        let bare = BareCalls::Known(&state.tool_names);
        let markers = find_markers(&buffer, bare);

        let mut tool_calls = Vec::new();
        for (i, segment) in action_segments(&buffer, bare).into_iter().enumerate() {
            let Some(action) = parse_action(segment, &self.factors) else {
                warn!(segment, "Unparseable action marker skipped");
                continue;
            };
            // Keep ids already announced during streaming.
            let id = state
                .tool_calls
                .get(i)
                .filter(|c| c.name == action.action_type)
                .map(|c| c.id.clone())
                .unwrap_or_else(MessageToolCall::generate_id);
            tool_calls.push(MessageToolCall {
                id,
                name: action.action_type.clone(),
                arguments: arguments_json(&action),
            });
        }

        let content = if !markers.is_empty() && tool_calls.is_empty() {
            buffer.trim().to_string()
        } else {
            visible_prose(&buffer, &markers, &state.tool_names, true)
        };

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
        if response.tool_calls.is_empty() {
            return Message::assistant(response.content.clone());
        }
        let mut text = String::new();
        if !response.content.is_empty() {
            text.push_str(&format!("{THOUGHT_LABEL} {}\n", response.content));
        }
        let actions: Vec<String> = response.tool_calls.iter().map(format_call).collect();
        text.push_str(&format!("{ACTION_LABEL} {}", actions.join("\n")));
        Message::assistant(text)
    }

    fn build_tool_result_messages(&self, results: &[ToolResult]) -> Vec<Message> {
        tool_results_as_user_messages(results)
    }
}
