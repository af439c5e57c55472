//! # Toolwright Planner
//!
//! Gates which tools the model sees based on a staged plan
//! (`plan -> execute -> completed`) and contributes a prompt fragment per
//! stage. The plan itself is written by the model through the `create_plan`
//! and `update_plan` tools and read back from the session's event stream.

pub mod planner;
pub mod registry;
pub mod state;
pub mod strategy;
pub mod tools;

use thiserror::Error;

pub use planner::Planner;
pub use registry::{PlannerRegistry, StrategyFactory, factory_of};
pub use state::{PlanProgress, PlanStage, PlanState};
pub use strategy::{
    DefaultStrategy, FilterRecord, PlannerStrategy, SequentialThinkingStrategy, ToolFilterResult,
};

#[derive(Debug, Clone, Error)]
pub enum PlannerError {
    #[error("Planner strategy already registered: {0}")]
    DuplicateStrategy(String),

    #[error("Unknown planner strategy: {0}")]
    UnknownStrategy(String),
}
