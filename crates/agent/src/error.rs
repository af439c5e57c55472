use thiserror::Error;
use toolwright_core::error::{EventError, ProviderError, ToolError};

#[derive(Debug, Error)]
pub enum AgentError {
    /// `run` was called while another run on the same agent is in flight.
    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Raised while building the agent, e.g. duplicate tool names.
    #[error("Tool registration failed: {0}")]
    Tool(#[from] ToolError),

    #[error("Run task failed: {0}")]
    Join(String),
}
