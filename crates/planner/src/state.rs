//! Plan State: the planner's view of where a session stands.

use serde::{Deserialize, Serialize};
use toolwright_core::event::PlanStep;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStage {
    /// No plan yet.
    #[default]
    Plan,
    /// A plan exists and is being worked through.
    Execute,
}

/// Outcome of a strategy's evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanProgress {
    Plan,
    Execute,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanState {
    pub stage: PlanStage,
    pub steps: Vec<PlanStep>,
    pub completed: bool,
    pub session_id: String,
    pub iteration: u32,
}

impl PlanState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn has_plan(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn all_steps_done(&self) -> bool {
        self.has_plan() && self.steps.iter().all(|s| s.done)
    }

    pub fn progress(&self) -> PlanProgress {
        match (self.completed, self.stage) {
            (true, _) => PlanProgress::Completed,
            (false, PlanStage::Plan) => PlanProgress::Plan,
            (false, PlanStage::Execute) => PlanProgress::Execute,
        }
    }

    pub fn apply_progress(&mut self, progress: PlanProgress) {
        match progress {
            PlanProgress::Plan => {
                self.stage = PlanStage::Plan;
                self.completed = false;
            }
            PlanProgress::Execute => {
                self.stage = PlanStage::Execute;
                self.completed = false;
            }
            PlanProgress::Completed => {
                self.stage = PlanStage::Execute;
                self.completed = true;
            }
        }
    }

    /// Plan rendered as a checklist.
    pub fn checklist(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let mark = if step.done { "x" } else { " " };
                format!("{}. [{mark}] {}", i + 1, step.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
