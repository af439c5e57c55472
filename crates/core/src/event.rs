//! Session events: the append-only record of everything that happens in a run.
//!
//! Every state transition the agent loop goes through (user input, streamed
//! deltas, tool calls and results, plan updates, run start/end) becomes one
//! [`Event`]. Events serialize to a single line of JSON so streaming
//! transports can forward them one by one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::EventError;
use crate::message::MessageToolCall;

/// An immutable, uniquely identified record of one session transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: String,

    /// When the event was created. Informational; ordering is append order.
    pub timestamp: DateTime<Utc>,

    /// Type tag plus payload
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Input from the user that starts (or continues) a run.
    UserMessage { content: String },

    /// A finalized assistant turn.
    AssistantMessage {
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<MessageToolCall>,
        finish_reason: String,
    },

    /// A user-visible content delta of an assistant turn in flight.
    AssistantStreamingMessage {
        message_id: String,
        content: String,
        is_complete: bool,
    },

    /// Finalized reasoning text of an assistant turn.
    AssistantThinkingMessage { message_id: String, content: String },

    /// A reasoning delta.
    AssistantStreamingThinkingMessage {
        message_id: String,
        content: String,
        is_complete: bool,
    },

    /// A tool-call fragment observed while the turn is still streaming.
    AssistantStreamingToolCall {
        message_id: String,
        tool_call_id: String,
        name: String,
        arguments_delta: String,
        is_complete: bool,
    },

    /// A tool call the loop is about to execute.
    ToolCall {
        tool_call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// The outcome of a tool call.
    ToolResult {
        tool_call_id: String,
        name: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        elapsed_ms: u64,
    },

    PlanStart { session_id: String },

    PlanUpdate {
        session_id: String,
        steps: Vec<PlanStep>,
    },

    PlanFinish {
        session_id: String,
        summary: String,
    },

    AgentRunStart {
        session_id: String,
        engine: String,
        max_iterations: u32,
    },

    AgentRunEnd {
        session_id: String,
        status: RunStatus,
        iterations: u32,
        elapsed_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_content: Option<String>,
    },

    /// Context injected by the environment or by a hook, shown to the model
    /// as user-side input.
    EnvironmentInput {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// A runtime notice: retries, recovered parse failures, fatal errors.
    System {
        level: SystemLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    FinalAnswer {
        message_id: String,
        content: String,
    },

    FinalAnswerStreaming {
        message_id: String,
        content: String,
        is_complete: bool,
    },
}

/// The type tag of an event, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserMessage,
    AssistantMessage,
    AssistantStreamingMessage,
    AssistantThinkingMessage,
    AssistantStreamingThinkingMessage,
    AssistantStreamingToolCall,
    ToolCall,
    ToolResult,
    PlanStart,
    PlanUpdate,
    PlanFinish,
    AgentRunStart,
    AgentRunEnd,
    EnvironmentInput,
    System,
    FinalAnswer,
    FinalAnswerStreaming,
}

impl EventType {
    /// Types that carry incremental deltas of something still in flight.
    pub const STREAMING: [EventType; 4] = [
        EventType::AssistantStreamingMessage,
        EventType::AssistantStreamingThinkingMessage,
        EventType::AssistantStreamingToolCall,
        EventType::FinalAnswerStreaming,
    ];

    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AssistantMessage => "assistant_message",
            Self::AssistantStreamingMessage => "assistant_streaming_message",
            Self::AssistantThinkingMessage => "assistant_thinking_message",
            Self::AssistantStreamingThinkingMessage => "assistant_streaming_thinking_message",
            Self::AssistantStreamingToolCall => "assistant_streaming_tool_call",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::PlanStart => "plan_start",
            Self::PlanUpdate => "plan_update",
            Self::PlanFinish => "plan_finish",
            Self::AgentRunStart => "agent_run_start",
            Self::AgentRunEnd => "agent_run_end",
            Self::EnvironmentInput => "environment_input",
            Self::System => "system",
            Self::FinalAnswer => "final_answer",
            Self::FinalAnswerStreaming => "final_answer_streaming",
        }
    }

    pub fn is_streaming(&self) -> bool {
        Self::STREAMING.contains(self)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub content: String,
    #[serde(default)]
    pub done: bool,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The model stopped calling tools and no hook vetoed termination.
    Completed,
    /// The iteration cap was reached.
    MaxIterations,
    /// The run was cancelled.
    Aborted,
    /// A fatal error ended the run.
    Error,
}

/// Severity of a `system` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::UserMessage { .. } => EventType::UserMessage,
            Self::AssistantMessage { .. } => EventType::AssistantMessage,
            Self::AssistantStreamingMessage { .. } => EventType::AssistantStreamingMessage,
            Self::AssistantThinkingMessage { .. } => EventType::AssistantThinkingMessage,
            Self::AssistantStreamingThinkingMessage { .. } => {
                EventType::AssistantStreamingThinkingMessage
            }
            Self::AssistantStreamingToolCall { .. } => EventType::AssistantStreamingToolCall,
            Self::ToolCall { .. } => EventType::ToolCall,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::PlanStart { .. } => EventType::PlanStart,
            Self::PlanUpdate { .. } => EventType::PlanUpdate,
            Self::PlanFinish { .. } => EventType::PlanFinish,
            Self::AgentRunStart { .. } => EventType::AgentRunStart,
            Self::AgentRunEnd { .. } => EventType::AgentRunEnd,
            Self::EnvironmentInput { .. } => EventType::EnvironmentInput,
            Self::System { .. } => EventType::System,
            Self::FinalAnswer { .. } => EventType::FinalAnswer,
            Self::FinalAnswerStreaming { .. } => EventType::FinalAnswerStreaming,
        }
    }

    /// Check that identifier fields the rest of the runtime keys on are present.
    pub fn validate(&self) -> Result<(), EventError> {
        let event_type = self.event_type().as_str();
        let require = |value: &str, field: &'static str| {
            if value.trim().is_empty() {
                Err(EventError::MissingField { event_type, field })
            } else {
                Ok(())
            }
        };

        match self {
            Self::AssistantMessage { message_id, tool_calls, .. } => {
                require(message_id, "message_id")?;
                for tc in tool_calls {
                    require(&tc.id, "tool_calls.id")?;
                    require(&tc.name, "tool_calls.name")?;
                }
                Ok(())
            }
            Self::AssistantStreamingMessage { message_id, .. }
            | Self::AssistantThinkingMessage { message_id, .. }
            | Self::AssistantStreamingThinkingMessage { message_id, .. }
            | Self::FinalAnswer { message_id, .. }
            | Self::FinalAnswerStreaming { message_id, .. } => require(message_id, "message_id"),
            Self::AssistantStreamingToolCall { message_id, tool_call_id, .. } => {
                require(message_id, "message_id")?;
                require(tool_call_id, "tool_call_id")
            }
            Self::ToolCall { tool_call_id, name, .. } | Self::ToolResult { tool_call_id, name, .. } => {
                require(tool_call_id, "tool_call_id")?;
                require(name, "name")
            }
            Self::PlanStart { session_id }
            | Self::PlanUpdate { session_id, .. }
            | Self::PlanFinish { session_id, .. }
            | Self::AgentRunStart { session_id, .. }
            | Self::AgentRunEnd { session_id, .. } => require(session_id, "session_id"),
            Self::System { message, .. } => require(message, "message"),
            Self::UserMessage { .. } | Self::EnvironmentInput { .. } => Ok(()),
        }
    }
}

impl Event {
    /// Stamp a payload with a fresh id and the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.id.trim().is_empty() {
            return Err(EventError::MissingField {
                event_type: self.event_type().as_str(),
                field: "id",
            });
        }
        self.kind.validate()
    }

    /// Encode as one line of JSON (no embedded newlines).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one line of JSON and validate the result.
    pub fn from_json_line(line: &str) -> Result<Self, EventError> {
        let event: Self =
            serde_json::from_str(line.trim()).map_err(|e| EventError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}
