//! # Toolwright Engine
//!
//! Tool-call engines adapt the agent loop to a provider's tool-calling
//! convention. Three are built in:
//!
//! - [`NativeEngine`] for providers with native function calling
//! - [`StructuredOutputsEngine`] for providers with JSON-schema output
//! - [`PromptEngineeringEngine`] for plain-text models using action markers
//!
//! All three produce the same [`ParsedModelResponse`], so the loop never
//! needs to know which one is active.

pub mod action_parser;
pub mod engine;
pub mod json_scan;
pub mod native;
pub mod prompt_engineering;
pub mod structured_outputs;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use action_parser::{ParsedAction, ScaleFactors, parse_action, parse_prediction};
pub use engine::{
    ChunkOutcome, EngineError, ParsedModelResponse, PrepareRequestContext, StreamProcessingState,
    ToolCallAccumulator, ToolCallEngine, ToolCallUpdate,
};
pub use native::NativeEngine;
pub use prompt_engineering::PromptEngineeringEngine;
pub use structured_outputs::StructuredOutputsEngine;

/// Selector for the built-in engines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallEngineKind {
    #[default]
    Native,
    StructuredOutputs,
    PromptEngineering,
}

impl ToolCallEngineKind {
    pub const ALL: [ToolCallEngineKind; 3] = [
        ToolCallEngineKind::Native,
        ToolCallEngineKind::StructuredOutputs,
        ToolCallEngineKind::PromptEngineering,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::StructuredOutputs => "structured_outputs",
            Self::PromptEngineering => "prompt_engineering",
        }
    }

    /// Parse a configured name, falling back to `Native` with a warning.
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|err: EngineError| {
            warn!(%err, "Falling back to the native tool-call engine");
            Self::Native
        })
    }
}

impl fmt::Display for ToolCallEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolCallEngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "native" => Ok(Self::Native),
            "structured_outputs" | "structuredoutputs" => Ok(Self::StructuredOutputs),
            "prompt_engineering" | "promptengineering" => Ok(Self::PromptEngineering),
            _ => Err(EngineError::UnknownKind(s.to_string())),
        }
    }
}

/// Build the engine for `kind`. Scale factors only affect the text-marker engine.
pub fn create_engine(kind: ToolCallEngineKind, factors: ScaleFactors) -> Arc<dyn ToolCallEngine> {
    match kind {
        ToolCallEngineKind::Native => Arc::new(NativeEngine::new()),
        ToolCallEngineKind::StructuredOutputs => Arc::new(StructuredOutputsEngine::new()),
        ToolCallEngineKind::PromptEngineering => Arc::new(PromptEngineeringEngine::new(factors)),
    }
}
