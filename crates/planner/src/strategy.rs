//! Planner strategies decide stage transitions, tool visibility and the
//! prompt fragment for each stage.

use std::sync::Arc;

use serde::Serialize;
use toolwright_core::provider::ToolDefinition;
use toolwright_core::tool::Tool;

use crate::state::{PlanProgress, PlanState};
use crate::tools::{
    CREATE_PLAN, SEQUENTIAL_THINKING, UPDATE_PLAN, create_plan_tool, sequential_thinking_tool,
    update_plan_tool,
};

/// Explains why tools were shown or hidden at a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterRecord {
    pub strategy: String,
    pub stage: String,
    pub visible: Vec<String>,
    pub hidden: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ToolFilterResult {
    pub tools: Vec<ToolDefinition>,
    pub record: FilterRecord,
}

pub trait PlannerStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Where the plan stands. Only this decides stage advances.
    fn evaluate(&self, state: &PlanState) -> PlanProgress;

    fn build_tools(&self, state: &PlanState, available: &[ToolDefinition]) -> ToolFilterResult;

    fn prompt_fragment(&self, state: &PlanState) -> String;

    /// Tools this strategy needs registered.
    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

fn progress_label(progress: PlanProgress) -> &'static str {
    match progress {
        PlanProgress::Plan => "plan",
        PlanProgress::Execute => "execute",
        PlanProgress::Completed => "completed",
    }
}

fn split_tools(
    available: &[ToolDefinition],
    keep: impl Fn(&str) -> bool,
) -> (Vec<ToolDefinition>, Vec<String>, Vec<String>) {
    let mut tools = Vec::new();
    let mut visible = Vec::new();
    let mut hidden = Vec::new();
    for def in available {
        if keep(&def.name) {
            visible.push(def.name.clone());
            tools.push(def.clone());
        } else {
            hidden.push(def.name.clone());
        }
    }
    (tools, visible, hidden)
}

/// Plan first, then execute.
///
/// Until a plan exists only `create_plan` is offered. Once it does, every
/// tool except `create_plan` is opened and `update_plan` tracks progress.
#[derive(Debug, Clone, Default)]
pub struct DefaultStrategy;

impl DefaultStrategy {
    pub const NAME: &'static str = "default";

    fn filter(
        &self,
        name: &str,
        state: &PlanState,
        available: &[ToolDefinition],
        forced: &[&str],
    ) -> ToolFilterResult {
        let progress = self.evaluate(state);
        let reason = match progress {
            PlanProgress::Plan => "no plan yet: only planning tools are visible",
            PlanProgress::Execute => "plan in progress: all tools visible, create_plan hidden",
            PlanProgress::Completed => "plan completed: all tools visible",
        };
        let (tools, visible, hidden) = split_tools(available, |tool| {
            forced.iter().any(|f| *f == tool)
                || match progress {
                    PlanProgress::Plan => tool == CREATE_PLAN,
                    PlanProgress::Execute => tool != CREATE_PLAN,
                    PlanProgress::Completed => true,
                }
        });
        ToolFilterResult {
            tools,
            record: FilterRecord {
                strategy: name.to_string(),
                stage: progress_label(progress).to_string(),
                visible,
                hidden,
                reason: reason.to_string(),
            },
        }
    }

    fn fragment(&self, state: &PlanState) -> String {
        match self.evaluate(state) {
            PlanProgress::Plan => format!(
                "## Planning\nBefore doing anything else, call `{CREATE_PLAN}` with the ordered steps \
                 you will take. Keep steps concrete and few."
            ),
            PlanProgress::Execute => format!(
                "## Current plan\n{}\n\nWork through the steps in order. After finishing a step, call \
                 `{UPDATE_PLAN}` with every step and its done flag.",
                state.checklist()
            ),
            PlanProgress::Completed => format!(
                "## Plan completed\n{}\n\nAll steps are done. Give the user the final answer.",
                state.checklist()
            ),
        }
    }
}

impl PlannerStrategy for DefaultStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, state: &PlanState) -> PlanProgress {
        if !state.has_plan() {
            PlanProgress::Plan
        } else if state.all_steps_done() {
            PlanProgress::Completed
        } else {
            PlanProgress::Execute
        }
    }

    fn build_tools(&self, state: &PlanState, available: &[ToolDefinition]) -> ToolFilterResult {
        self.filter(Self::NAME, state, available, &[])
    }

    fn prompt_fragment(&self, state: &PlanState) -> String {
        self.fragment(state)
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![create_plan_tool(), update_plan_tool()]
    }
}

/// Default planning with a `sequential_thinking` tool visible at every stage.
#[derive(Debug, Clone, Default)]
pub struct SequentialThinkingStrategy {
    inner: DefaultStrategy,
}

impl SequentialThinkingStrategy {
    pub const NAME: &'static str = "sequential_thinking";
}

impl PlannerStrategy for SequentialThinkingStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, state: &PlanState) -> PlanProgress {
        self.inner.evaluate(state)
    }

    fn build_tools(&self, state: &PlanState, available: &[ToolDefinition]) -> ToolFilterResult {
        self.inner
            .filter(Self::NAME, state, available, &[SEQUENTIAL_THINKING])
    }

    fn prompt_fragment(&self, state: &PlanState) -> String {
        format!(
            "{}\n\nUse `{SEQUENTIAL_THINKING}` to reason step by step whenever the next move is unclear.",
            self.inner.fragment(state)
        )
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools = self.inner.tools();
        tools.push(sequential_thinking_tool());
        tools
    }
}
