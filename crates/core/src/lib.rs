//! # Toolwright Core
//!
//! Domain types, traits, and error definitions for the Toolwright agent runtime.
//! This crate has **zero framework dependencies**: it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is defined as a trait here (providers, tools).
//! Implementations live outside. The session [`EventStream`] is the single
//! source of truth for a conversation: message history, latest responses and
//! plan state are all derived from it.

pub mod error;
pub mod event;
pub mod event_stream;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, EventError, ProviderError, Result, ToolError};
pub use event::{Event, EventKind, EventType, PlanStep, RunStatus, SystemLevel};
pub use event_stream::{EventStream, EventStreamOptions, Subscription};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta,
    ToolDefinition, Usage,
};
pub use tool::{FunctionTool, Tool, ToolCall, ToolContext, ToolRegistry, ToolResult};
