//! The agent loop for Toolwright.
//!
//! Each iteration follows the same cycle:
//!
//! 1. **Plan**: the planner (if any) folds plan updates and picks the visible tools
//! 2. **Ask**: the event log is folded into history and sent through the tool-call engine
//! 3. **Stream**: provider chunks are parsed as they arrive and published as deltas
//! 4. **Act**: tool calls are executed and their results published
//! 5. **Repeat** until the model answers without tool calls
//!
//! The loop also ends when the iteration cap is hit, the run is cancelled,
//! or the provider fails for good. Everything that happens is an event on
//! the session's [`EventStream`](toolwright_core::EventStream).

pub mod error;
pub mod history;
pub mod hooks;
pub mod loop_runner;
pub mod retry;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use error::AgentError;
pub use history::build_history;
pub use hooks::{AgentHooks, HookContext, LoggingHooks, RequireToolBeforeFinish, TerminationDecision};
pub use loop_runner::{Agent, AgentBuilder, AgentStatus, RunOptions, RunOutcome};
pub use retry::RetryPolicy;
pub use stream_event::RunEventStream;
