//! The planner: folds plan tool calls from the event stream into a Plan
//! State and gates tool visibility on it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use toolwright_core::error::EventError;
use toolwright_core::event::EventKind;
use toolwright_core::event_stream::EventStream;
use toolwright_core::provider::ToolDefinition;
use toolwright_core::tool::Tool;
use tracing::{debug, info, warn};

use crate::state::{PlanProgress, PlanState};
use crate::strategy::{PlannerStrategy, ToolFilterResult};
use crate::tools::{CREATE_PLAN, UPDATE_PLAN, steps_from_create, steps_from_update};

#[derive(Default)]
struct PlannerInner {
    state: PlanState,
    processed: HashSet<String>,
    /// Newest event at the last reset. Only later events are folded.
    since: Option<String>,
    started: bool,
    finished: bool,
}

pub struct Planner {
    strategy: Arc<dyn PlannerStrategy>,
    events: Arc<EventStream>,
    inner: Mutex<PlannerInner>,
}

impl Planner {
    pub fn new(strategy: Arc<dyn PlannerStrategy>, events: Arc<EventStream>) -> Self {
        Self {
            strategy,
            events,
            inner: Mutex::new(PlannerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlannerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Start over for a new run. Plan calls already in the event stream
    /// belong to earlier runs and are ignored from now on.
    pub fn reset(&self, session_id: &str) {
        let since = self
            .events
            .get_events(None, Some(1))
            .pop()
            .map(|event| event.id);
        let mut inner = self.lock();
        *inner = PlannerInner {
            state: PlanState::new(session_id),
            since,
            ..PlannerInner::default()
        };
    }

    /// Called at the top of every loop iteration.
    ///
    /// Picks up `create_plan` / `update_plan` calls published since the last
    /// iteration, lets the strategy evaluate the result, and publishes the
    /// plan lifecycle events. Events are published after the planner's lock
    /// is released, so subscribers may read planner state.
    pub fn on_each_agent_loop_start(&self, iteration: u32) -> Result<(), EventError> {
        let pending = {
            let mut inner = self.lock();
            inner.state.iteration = iteration;
            let session_id = inner.state.session_id.clone();
            let mut pending = Vec::new();

            let events = self.events.get_events(None, None);
            // A trimmed marker means everything older is gone too.
            let start = inner
                .since
                .as_ref()
                .and_then(|id| events.iter().position(|e| &e.id == id))
                .map_or(0, |i| i + 1);

            for event in events.into_iter().skip(start) {
                let EventKind::ToolCall {
                    tool_call_id,
                    name,
                    arguments,
                } = event.kind
                else {
                    continue;
                };
                if name != CREATE_PLAN && name != UPDATE_PLAN {
                    continue;
                }
                if !inner.processed.insert(tool_call_id.clone()) {
                    continue;
                }
                let steps = if name == CREATE_PLAN {
                    steps_from_create(&arguments)
                } else {
                    steps_from_update(&arguments)
                };
                let Some(steps) = steps else {
                    warn!(%tool_call_id, tool = %name, "Ignoring plan call without usable steps");
                    continue;
                };

                if !inner.started {
                    inner.started = true;
                    pending.push(EventKind::PlanStart {
                        session_id: session_id.clone(),
                    });
                }
                debug!(tool = %name, steps = steps.len(), "Plan updated");
                inner.state.steps = steps.clone();
                pending.push(EventKind::PlanUpdate {
                    session_id: session_id.clone(),
                    steps,
                });
            }

            let progress = self.strategy.evaluate(&inner.state);
            inner.state.apply_progress(progress);
            if progress == PlanProgress::Completed && !inner.finished {
                inner.finished = true;
                let summary = format!(
                    "Completed {} step(s): {}",
                    inner.state.steps.len(),
                    inner
                        .state
                        .steps
                        .iter()
                        .map(|s| s.content.as_str())
                        .collect::<Vec<_>>()
                        .join("; ")
                );
                info!(iteration, "Plan finished");
                pending.push(EventKind::PlanFinish {
                    session_id,
                    summary,
                });
            }
            pending
        };

        for kind in pending {
            self.events.publish(kind)?;
        }
        Ok(())
    }

    pub fn build_tools(&self, available: &[ToolDefinition]) -> ToolFilterResult {
        let inner = self.lock();
        self.strategy.build_tools(&inner.state, available)
    }

    pub fn prompt_fragment(&self) -> String {
        let inner = self.lock();
        self.strategy.prompt_fragment(&inner.state)
    }

    pub fn state(&self) -> PlanState {
        self.lock().state.clone()
    }

    /// Tools to register alongside the agent's own.
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.strategy.tools()
    }
}
