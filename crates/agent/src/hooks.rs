//! Lifecycle hooks for the agent loop.
//!
//! Implement [`AgentHooks`] to observe or steer a run:
//!
//! - [`AgentHooks::before_loop_start`] - runs at the top of every iteration
//! - [`AgentHooks::after_tool_call`] - observes each tool result before it is published
//! - [`AgentHooks::before_loop_termination`] - may veto the end of a run
//! - [`AgentHooks::loop_end`] - runs once when the run is over
//!
//! Every method has a no-op default.

use std::sync::Arc;

use async_trait::async_trait;
use toolwright_core::event_stream::EventStream;
use toolwright_core::tool::{ToolCall, ToolResult};
use toolwright_engine::ParsedModelResponse;

use crate::loop_runner::RunOutcome;

/// What a hook sees of the run in progress.
#[derive(Clone)]
pub struct HookContext {
    pub session_id: String,
    pub iteration: u32,
    pub events: Arc<EventStream>,
}

/// Verdict of a termination hook.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationDecision {
    /// Let the run end.
    Finish,
    /// Keep going. `message` is shown to the model as environment input.
    Continue { message: String },
}

#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn before_loop_start(&self, _ctx: &HookContext) {}

    async fn after_tool_call(&self, _ctx: &HookContext, _call: &ToolCall, _result: &ToolResult) {}

    /// Called when the model answered without tool calls. The first hook
    /// returning `Continue` wins.
    async fn before_loop_termination(
        &self,
        _ctx: &HookContext,
        _response: &ParsedModelResponse,
    ) -> TerminationDecision {
        TerminationDecision::Finish
    }

    async fn loop_end(&self, _ctx: &HookContext, _outcome: &RunOutcome) {}
}

/// Hooks that log every lifecycle step (useful for debugging)
pub struct LoggingHooks;

#[async_trait]
impl AgentHooks for LoggingHooks {
    async fn before_loop_start(&self, ctx: &HookContext) {
        tracing::debug!(session_id = %ctx.session_id, iteration = ctx.iteration, "Loop start");
    }

    async fn after_tool_call(&self, _ctx: &HookContext, call: &ToolCall, result: &ToolResult) {
        tracing::debug!(
            tool = %call.name,
            success = !result.is_error(),
            elapsed_ms = result.elapsed_ms,
            "Tool call finished"
        );
    }

    async fn loop_end(&self, ctx: &HookContext, outcome: &RunOutcome) {
        tracing::debug!(
            session_id = %ctx.session_id,
            status = ?outcome.status,
            iterations = outcome.iterations,
            "Loop end"
        );
    }
}

/// Vetoes termination until a named tool has been called at least once in
/// the session, e.g. to enforce a mandatory final report.
pub struct RequireToolBeforeFinish {
    tool_name: String,
    message: String,
}

impl RequireToolBeforeFinish {
    pub fn new(tool_name: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        let message = format!("Before finishing, call the `{tool_name}` tool.");
        Self { tool_name, message }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[async_trait]
impl AgentHooks for RequireToolBeforeFinish {
    async fn before_loop_termination(
        &self,
        ctx: &HookContext,
        _response: &ParsedModelResponse,
    ) -> TerminationDecision {
        let called = ctx
            .events
            .get_events_by_type(&[toolwright_core::event::EventType::ToolCall], None)
            .iter()
            .any(|e| {
                matches!(&e.kind, toolwright_core::event::EventKind::ToolCall { name, .. } if *name == self.tool_name)
            });
        if called {
            TerminationDecision::Finish
        } else {
            TerminationDecision::Continue {
                message: self.message.clone(),
            }
        }
    }
}
