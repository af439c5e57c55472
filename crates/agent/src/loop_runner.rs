//! The agent loop implementation.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use toolwright_config::{DispatchMode, RuntimeConfig};
use toolwright_core::error::ProviderError;
use toolwright_core::event::{EventKind, RunStatus, SystemLevel};
use toolwright_core::event_stream::{EventStream, EventStreamOptions, Subscription};
use toolwright_core::message::{Message, MessageToolCall};
use toolwright_core::provider::{Provider, ProviderRequest, ToolDefinition};
use toolwright_core::tool::{Tool, ToolCall, ToolContext, ToolRegistry, ToolResult};
use toolwright_engine::{
    ChunkOutcome, ParsedModelResponse, PrepareRequestContext, ScaleFactors, ToolCallEngine,
    ToolCallEngineKind, create_engine,
};
use toolwright_planner::{Planner, PlannerRegistry, PlannerStrategy};
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::history::build_history;
use crate::hooks::{AgentHooks, HookContext, TerminationDecision};
use crate::retry::RetryPolicy;
use crate::stream_event::RunEventStream;

/// Where the agent is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Running,
    ToolDispatch,
    Terminating,
    /// The last run was cancelled.
    Aborted,
    /// The last run ended on a fatal error.
    Error,
}

impl AgentStatus {
    /// A run is in flight.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Running | Self::ToolDispatch | Self::Terminating)
    }
}

/// Input for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: String,
    /// Extra context, each published as an `environment_input` event.
    pub contexts: Vec<String>,
    /// External cancellation. A fresh token is used when absent.
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.contexts.push(context.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// What a finished run reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// The final answer, only set for `Completed` runs.
    pub final_content: Option<String>,
    pub iterations: u32,
    pub tool_calls_made: usize,
    pub session_id: String,
}

#[derive(Default)]
struct Progress {
    iterations: u32,
    tool_calls_made: usize,
    final_content: Option<String>,
}

/// One finalized model turn.
struct Turn {
    message_id: String,
    response: ParsedModelResponse,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The orchestrator: streams a model turn through the engine, publishes
/// everything to the event stream, dispatches tool calls, and repeats until
/// the model stops calling tools or the iteration cap is hit.
///
/// One agent is one session. Runs on the same agent share the event stream,
/// so later runs see earlier ones as history.
pub struct Agent {
    provider: Arc<dyn Provider>,
    engine: Arc<dyn ToolCallEngine>,
    tools: Arc<ToolRegistry>,
    planner: Option<Planner>,
    hooks: Vec<Arc<dyn AgentHooks>>,
    events: Arc<EventStream>,

    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    instructions: String,
    max_iterations: u32,
    retry: RetryPolicy,
    dispatch: DispatchMode,

    session_id: String,
    status: Mutex<AgentStatus>,
    current_cancel: Mutex<Option<CancellationToken>>,
}

impl Agent {
    pub fn builder(provider: Arc<dyn Provider>) -> AgentBuilder {
        AgentBuilder::new(provider)
    }

    pub fn status(&self) -> AgentStatus {
        *lock(&self.status)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn engine_kind(&self) -> ToolCallEngineKind {
        self.engine.kind()
    }

    pub fn planner(&self) -> Option<&Planner> {
        self.planner.as_ref()
    }

    /// Cancel the run in flight, if any.
    pub fn abort(&self) {
        if let Some(token) = lock(&self.current_cancel).as_ref() {
            info!(session_id = %self.session_id, "Aborting run");
            token.cancel();
        }
    }

    /// Run to completion.
    ///
    /// Fails only when another run is in flight. Everything else, including
    /// provider failures and cancellation, is reported through
    /// [`RunOutcome::status`] and the event stream.
    pub async fn run(&self, options: RunOptions) -> Result<RunOutcome, AgentError> {
        let cancel = self.begin(options.cancel.clone())?;
        Ok(self.execute(options, cancel).await)
    }

    /// Run in the background and receive every event as it is published.
    ///
    /// The stream ends after `agent_run_end`. Dropping it cancels the run.
    pub fn run_streaming(self: &Arc<Self>, options: RunOptions) -> Result<RunEventStream, AgentError> {
        let cancel = self.begin(options.cancel.clone())?;

        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.events.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });

        let mut guard = StreamingRun {
            agent: Arc::clone(self),
            subscription: Some(subscription),
            finished: false,
        };
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = guard.agent.execute(options, run_cancel).await;
            guard.finished = true;
            outcome
        });

        Ok(RunEventStream::new(rx, cancel, handle))
    }

    fn begin(&self, cancel: Option<CancellationToken>) -> Result<CancellationToken, AgentError> {
        let mut status = lock(&self.status);
        if status.is_busy() {
            return Err(AgentError::AlreadyRunning);
        }
        *status = AgentStatus::Running;
        let token = cancel.unwrap_or_default();
        *lock(&self.current_cancel) = Some(token.clone());
        Ok(token)
    }

    fn set_status(&self, status: AgentStatus) {
        *lock(&self.status) = status;
    }

    fn finish(&self, status: RunStatus) {
        *lock(&self.current_cancel) = None;
        self.set_status(match status {
            RunStatus::Aborted => AgentStatus::Aborted,
            RunStatus::Error => AgentStatus::Error,
            RunStatus::Completed | RunStatus::MaxIterations => AgentStatus::Idle,
        });
    }

    fn hook_context(&self, iteration: u32) -> HookContext {
        HookContext {
            session_id: self.session_id.clone(),
            iteration,
            events: Arc::clone(&self.events),
        }
    }

    /// Publish an event whose failure must not end the run.
    fn publish_quietly(&self, kind: EventKind) {
        if let Err(err) = self.events.publish(kind) {
            warn!(%err, "Failed to publish event");
        }
    }

    async fn execute(&self, options: RunOptions, cancel: CancellationToken) -> RunOutcome {
        let started = Instant::now();
        let mut progress = Progress::default();

        info!(
            session_id = %self.session_id,
            engine = %self.engine.kind(),
            max_iterations = self.max_iterations,
            "Agent run starting"
        );

        let status = match self.drive(&options, &cancel, &mut progress).await {
            Ok(status) => status,
            Err(err) => {
                error!(session_id = %self.session_id, %err, "Agent run failed");
                self.publish_quietly(EventKind::System {
                    level: SystemLevel::Error,
                    message: err.to_string(),
                    details: None,
                });
                RunStatus::Error
            }
        };

        let outcome = RunOutcome {
            status,
            final_content: progress.final_content,
            iterations: progress.iterations,
            tool_calls_made: progress.tool_calls_made,
            session_id: self.session_id.clone(),
        };

        self.publish_quietly(EventKind::AgentRunEnd {
            session_id: self.session_id.clone(),
            status,
            iterations: outcome.iterations,
            elapsed_ms: started.elapsed().as_millis() as u64,
            final_content: outcome.final_content.clone(),
        });

        let ctx = self.hook_context(outcome.iterations);
        for hook in &self.hooks {
            hook.loop_end(&ctx, &outcome).await;
        }

        self.finish(status);
        info!(
            session_id = %self.session_id,
            status = ?status,
            iterations = outcome.iterations,
            tool_calls = outcome.tool_calls_made,
            "Agent run finished"
        );
        outcome
    }

    async fn drive(
        &self,
        options: &RunOptions,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<RunStatus, AgentError> {
        self.events.publish(EventKind::AgentRunStart {
            session_id: self.session_id.clone(),
            engine: self.engine.kind().to_string(),
            max_iterations: self.max_iterations,
        })?;
        self.events.publish(EventKind::UserMessage {
            content: options.input.clone(),
        })?;
        for context in &options.contexts {
            self.events.publish(EventKind::EnvironmentInput {
                content: context.clone(),
                description: None,
            })?;
        }
        if let Some(planner) = &self.planner {
            planner.reset(&self.session_id);
        }

        let available = self.tools.definitions();

        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                info!(iteration, "Run cancelled");
                return Ok(RunStatus::Aborted);
            }
            progress.iterations = iteration;
            self.set_status(AgentStatus::Running);
            debug!(iteration, "Agent loop iteration");

            if let Some(planner) = &self.planner {
                planner.on_each_agent_loop_start(iteration)?;
            }
            let ctx = self.hook_context(iteration);
            for hook in &self.hooks {
                hook.before_loop_start(&ctx).await;
            }

            let (request, visible) = self.build_request(&available);
            let Some(Turn {
                message_id,
                response,
            }) = self.stream_with_retry(request, &visible, cancel).await?
            else {
                info!(iteration, "Run cancelled while waiting for the model");
                return Ok(RunStatus::Aborted);
            };

            if let Some(reasoning) = response.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
                self.events.publish(EventKind::AssistantThinkingMessage {
                    message_id: message_id.clone(),
                    content: reasoning.clone(),
                })?;
            }
            self.events.publish(EventKind::AssistantMessage {
                message_id: message_id.clone(),
                content: response.content.clone(),
                reasoning_content: response.reasoning_content.clone(),
                tool_calls: response.tool_calls.clone(),
                finish_reason: response.finish_reason.clone(),
            })?;

            if response.has_tool_calls() {
                self.set_status(AgentStatus::ToolDispatch);
                let Some(count) = self.dispatch_tools(&response.tool_calls, &ctx, cancel).await?
                else {
                    info!(iteration, "Run cancelled during tool dispatch");
                    return Ok(RunStatus::Aborted);
                };
                progress.tool_calls_made += count;
                continue;
            }

            self.set_status(AgentStatus::Terminating);
            match self.termination_verdict(&ctx, &response).await {
                TerminationDecision::Finish => {
                    self.events.publish(EventKind::FinalAnswer {
                        message_id,
                        content: response.content.clone(),
                    })?;
                    progress.final_content = Some(response.content);
                    return Ok(RunStatus::Completed);
                }
                TerminationDecision::Continue { message } => {
                    info!(iteration, "Termination vetoed by hook");
                    self.events.publish(EventKind::EnvironmentInput {
                        content: message,
                        description: Some("termination hook".into()),
                    })?;
                }
            }
        }

        warn!(max_iterations = self.max_iterations, "Iteration cap reached");
        Ok(RunStatus::MaxIterations)
    }

    /// The request for the next turn, plus the tools it exposes.
    fn build_request(&self, available: &[ToolDefinition]) -> (ProviderRequest, Vec<ToolDefinition>) {
        let (tools, fragment) = match &self.planner {
            Some(planner) => {
                let filtered = planner.build_tools(available);
                debug!(
                    stage = %filtered.record.stage,
                    visible = ?filtered.record.visible,
                    hidden = ?filtered.record.hidden,
                    reason = %filtered.record.reason,
                    "Planner filtered tools"
                );
                (filtered.tools, planner.prompt_fragment())
            }
            None => (available.to_vec(), String::new()),
        };

        let base = if fragment.is_empty() {
            self.instructions.clone()
        } else {
            format!("{}\n\n{}", self.instructions, fragment)
        };

        let mut messages = vec![Message::system(
            self.engine.prepare_system_prompt(&base, &tools),
        )];
        messages.extend(build_history(
            &self.events.get_events(None, None),
            self.engine.as_ref(),
        ));

        let request = self.engine.prepare_request(PrepareRequestContext {
            model: self.model.clone(),
            messages,
            tools: tools.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        });
        (request, tools)
    }

    /// `Ok(None)` means the run was cancelled.
    async fn stream_with_retry(
        &self,
        request: ProviderRequest,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<Option<Turn>, AgentError> {
        let mut attempt = 0;
        loop {
            let err = match self.stream_once(request.clone(), tools, cancel).await {
                Ok(turn) => return Ok(turn),
                Err(err) => err,
            };
            attempt += 1;
            if !self.retry.should_retry(attempt, &err) {
                return Err(err.into());
            }

            let delay = self.retry.delay_for(attempt, &err);
            let delay_ms = delay.as_millis() as u64;
            warn!(%err, attempt, delay_ms, "Transient provider error, retrying");
            self.events.publish(EventKind::System {
                level: SystemLevel::Warning,
                message: format!("Provider error, retrying: {err}"),
                details: Some(json!({ "attempt": attempt, "delay_ms": delay_ms })),
            })?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One provider round trip, with streaming deltas published as they
    /// arrive. Each attempt gets its own message id.
    async fn stream_once(
        &self,
        request: ProviderRequest,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<Option<Turn>, ProviderError> {
        let message_id = uuid::Uuid::new_v4().to_string();

        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            rx = self.provider.stream(request) => rx?,
        };

        let mut state = self.engine.init_stream_state(tools);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = rx.recv() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            let outcome = self.engine.process_chunk(&chunk, &mut state);
            self.publish_deltas(&message_id, outcome);
            if chunk.done {
                break;
            }
        }

        self.publish_quietly(EventKind::AssistantStreamingMessage {
            message_id: message_id.clone(),
            content: String::new(),
            is_complete: true,
        });
        if !state.reasoning_buffer.is_empty() {
            self.publish_quietly(EventKind::AssistantStreamingThinkingMessage {
                message_id: message_id.clone(),
                content: String::new(),
                is_complete: true,
            });
        }

        let raw = state.content_buffer.clone();
        let response = match self.engine.finalize(state) {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "Engine could not finalize the response, keeping content only");
                self.publish_quietly(EventKind::System {
                    level: SystemLevel::Warning,
                    message: err.to_string(),
                    details: None,
                });
                ParsedModelResponse::content_only(raw)
            }
        };

        debug!(
            message_id = %message_id,
            tool_calls = response.tool_calls.len(),
            finish_reason = %response.finish_reason,
            "Model turn finalized"
        );
        Ok(Some(Turn {
            message_id,
            response,
        }))
    }

    fn publish_deltas(&self, message_id: &str, outcome: ChunkOutcome) {
        if !outcome.reasoning_content.is_empty() {
            self.publish_quietly(EventKind::AssistantStreamingThinkingMessage {
                message_id: message_id.to_string(),
                content: outcome.reasoning_content,
                is_complete: false,
            });
        }
        if !outcome.content.is_empty() {
            self.publish_quietly(EventKind::AssistantStreamingMessage {
                message_id: message_id.to_string(),
                content: outcome.content,
                is_complete: false,
            });
        }
        for update in outcome.tool_calls {
            self.publish_quietly(EventKind::AssistantStreamingToolCall {
                message_id: message_id.to_string(),
                tool_call_id: update.tool_call_id,
                name: update.name,
                arguments_delta: update.arguments_delta,
                is_complete: update.is_complete,
            });
        }
    }

    /// Publish the calls, execute them, publish the results, both in the
    /// model's order. `Ok(None)` means the run was cancelled: running tools
    /// still settle, but their results are discarded.
    async fn dispatch_tools(
        &self,
        calls: &[MessageToolCall],
        ctx: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, AgentError> {
        let calls: Vec<ToolCall> = calls.iter().map(to_tool_call).collect();
        for call in &calls {
            self.events.publish(EventKind::ToolCall {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            })?;
        }

        // Tools see the token through their context. Those that ignore it
        // run to completion.
        let results = self.execute_all(&calls, cancel).await;
        if cancel.is_cancelled() {
            info!(settled = results.len(), "Discarding tool results after cancellation");
            return Ok(None);
        }

        for (call, result) in calls.iter().zip(&results) {
            for hook in &self.hooks {
                hook.after_tool_call(ctx, call, result).await;
            }
        }
        for result in results {
            self.events.publish(EventKind::ToolResult {
                tool_call_id: result.tool_call_id,
                name: result.name,
                content: result.content,
                error: result.error,
                elapsed_ms: result.elapsed_ms,
            })?;
        }
        Ok(Some(calls.len()))
    }

    async fn execute_all(&self, calls: &[ToolCall], cancel: &CancellationToken) -> Vec<ToolResult> {
        match self.dispatch {
            DispatchMode::Parallel => {
                join_all(calls.iter().map(|call| self.execute_tool(call, cancel))).await
            }
            DispatchMode::Sequential => {
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    if cancel.is_cancelled() {
                        break;
                    }
                    results.push(self.execute_tool(call, cancel).await);
                }
                results
            }
        }
    }

    /// Never fails: unknown tools, invalid arguments, handler errors and
    /// panics all become error results.
    async fn execute_tool(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let ctx = ToolContext::new(call.id.clone(), cancel.child_token());
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.tools.execute(call, &ctx))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(content)) => {
                debug!(tool = %call.name, elapsed_ms, "Tool succeeded");
                ToolResult::success(&call.id, &call.name, content, elapsed_ms)
            }
            Ok(Err(err)) => {
                warn!(tool = %call.name, %err, "Tool failed");
                ToolResult::failure(&call.id, &call.name, err.to_string(), elapsed_ms)
            }
            Err(_) => {
                error!(tool = %call.name, "Tool panicked");
                ToolResult::failure(&call.id, &call.name, "Tool panicked", elapsed_ms)
            }
        }
    }

    async fn termination_verdict(
        &self,
        ctx: &HookContext,
        response: &ParsedModelResponse,
    ) -> TerminationDecision {
        for hook in &self.hooks {
            let decision = hook.before_loop_termination(ctx, response).await;
            if matches!(decision, TerminationDecision::Continue { .. }) {
                return decision;
            }
        }
        TerminationDecision::Finish
    }
}

/// Ends a background run's event feed however the task exits. A run that
/// never returned (it panicked) also releases the agent.
struct StreamingRun {
    agent: Arc<Agent>,
    subscription: Option<Subscription>,
    finished: bool,
}

impl Drop for StreamingRun {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if !self.finished {
            error!(session_id = %self.agent.session_id, "Agent run did not finish");
            self.agent.finish(RunStatus::Error);
        }
    }
}

/// Arguments that are not valid JSON are passed on as a string, which fails
/// validation and surfaces as an error result.
fn to_tool_call(call: &MessageToolCall) -> ToolCall {
    let arguments = serde_json::from_str(&call.arguments)
        .unwrap_or_else(|_| Value::String(call.arguments.clone()));
    ToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments,
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    provider: Arc<dyn Provider>,
    engine: Arc<dyn ToolCallEngine>,
    tools: Vec<Arc<dyn Tool>>,
    planner: Option<Arc<dyn PlannerStrategy>>,
    hooks: Vec<Arc<dyn AgentHooks>>,
    events: Option<Arc<EventStream>>,
    event_options: EventStreamOptions,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    instructions: String,
    max_iterations: u32,
    retry: RetryPolicy,
    dispatch: DispatchMode,
    session_id: Option<String>,
}

impl AgentBuilder {
    /// A builder with default configuration: native engine, no planner.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self::from_config(&RuntimeConfig::default(), provider)
    }

    /// Apply a loaded configuration. Unknown engine or planner names fall
    /// back to the defaults with a warning.
    pub fn from_config(config: &RuntimeConfig, provider: Arc<dyn Provider>) -> Self {
        let kind = ToolCallEngineKind::from_name_or_default(&config.engine.kind);
        let [width, height] = config.engine.factors;
        let planner = config
            .planner
            .enabled
            .then(|| PlannerRegistry::new().create(&config.planner.strategy));

        Self {
            provider,
            engine: create_engine(kind, ScaleFactors { width, height }),
            tools: Vec::new(),
            planner,
            hooks: Vec::new(),
            events: None,
            event_options: EventStreamOptions {
                max_events: config.events.max_events,
                auto_trim: config.events.auto_trim,
            },
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            instructions: config.instructions.clone(),
            max_iterations: config.max_iterations,
            retry: RetryPolicy::from(&config.retry),
            dispatch: config.tools.dispatch,
            session_id: None,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn ToolCallEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_engine_kind(self, kind: ToolCallEngineKind) -> Self {
        self.with_engine(create_engine(kind, ScaleFactors::default()))
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_planner(mut self, strategy: Arc<dyn PlannerStrategy>) -> Self {
        self.planner = Some(strategy);
        self
    }

    pub fn without_planner(mut self) -> Self {
        self.planner = None;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn AgentHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Use an existing event stream, e.g. to resume a session.
    pub fn with_event_stream(mut self, events: Arc<EventStream>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Register every tool (the agent's, then the planner's). Duplicate
    /// names are rejected here, before any run.
    pub fn build(self) -> Result<Agent, AgentError> {
        let Self {
            provider,
            engine,
            tools,
            planner,
            hooks,
            events,
            event_options,
            model,
            temperature,
            max_tokens,
            instructions,
            max_iterations,
            retry,
            dispatch,
            session_id,
        } = self;

        let events = events.unwrap_or_else(|| Arc::new(EventStream::new(event_options)));
        let planner = planner.map(|strategy| Planner::new(strategy, Arc::clone(&events)));

        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool)?;
        }
        if let Some(planner) = &planner {
            for tool in planner.tools() {
                registry.register(tool)?;
            }
        }

        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!(
            session_id = %session_id,
            engine = %engine.kind(),
            tools = registry.len(),
            planner = planner.as_ref().map(|p| p.strategy_name()),
            "Agent built"
        );

        Ok(Agent {
            provider,
            engine,
            tools: Arc::new(registry),
            planner,
            hooks,
            events,
            model,
            temperature,
            max_tokens,
            instructions,
            max_iterations,
            retry,
            dispatch,
            session_id,
            status: Mutex::new(AgentStatus::Idle),
            current_cancel: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{Reply, ScriptedProvider, text, tool_call, tool_calls};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use toolwright_core::error::ToolError;
    use toolwright_core::event::{Event, EventType};
    use toolwright_core::message::Role;
    use toolwright_core::provider::StreamChunk;
    use toolwright_core::tool::FunctionTool;
    use toolwright_planner::DefaultStrategy;

    fn echo_tool() -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            "echo",
            "Echo the text back",
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
            |args: Value| async move { Ok(json!({ "echo": args["text"] })) },
        ))
    }

    fn sleepy_tool(name: &'static str, millis: u64) -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            name,
            "Sleep, then answer",
            json!({ "type": "object", "properties": {} }),
            move |_args: Value| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(json!(name))
            },
        ))
    }

    fn agent(provider: Arc<ScriptedProvider>) -> AgentBuilder {
        Agent::builder(provider).with_retry(RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        })
    }

    fn types(events: &[Event]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type()).collect()
    }

    fn count(events: &[Event], event_type: EventType) -> usize {
        events.iter().filter(|e| e.event_type() == event_type).count()
    }

    /// Every result of the run, in publish order.
    fn recorded_results(agent: &Agent) -> Vec<ToolResult> {
        agent
            .events()
            .get_events_by_type(&[EventType::ToolResult], None)
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::ToolResult {
                    tool_call_id,
                    name,
                    content,
                    error,
                    elapsed_ms,
                } => Some(ToolResult {
                    tool_call_id,
                    name,
                    content,
                    error,
                    elapsed_ms,
                }),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn text_answer_completes() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("Hello there")]));
        let agent = agent(provider.clone()).build().unwrap();

        let outcome = agent.run(RunOptions::new("hi")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_content.as_deref(), Some("Hello there"));
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.tool_calls_made, 0);
        assert_eq!(agent.status(), AgentStatus::Idle);
        assert_eq!(provider.call_count(), 1);

        let events = agent.events().get_events(None, None);
        let kinds = types(&events);
        assert_eq!(kinds.first(), Some(&EventType::AgentRunStart));
        assert_eq!(kinds[1], EventType::UserMessage);
        assert_eq!(kinds.last(), Some(&EventType::AgentRunEnd));
        assert_eq!(count(&events, EventType::AssistantMessage), 1);
        assert_eq!(count(&events, EventType::FinalAnswer), 1);
        assert!(count(&events, EventType::AssistantStreamingMessage) >= 2);
    }

    #[tokio::test]
    async fn streaming_deltas_share_the_final_message_id() {
        let provider = Arc::new(ScriptedProvider::new(vec![Reply::Chunks(vec![
            StreamChunk::text("Hel"),
            StreamChunk::text("lo"),
        ])]));
        let agent = agent(provider).build().unwrap();
        agent.run(RunOptions::new("hi")).await.unwrap();

        let events = agent.events().get_events(None, None);
        let final_id = events
            .iter()
            .find_map(|e| match &e.kind {
                EventKind::AssistantMessage { message_id, .. } => Some(message_id.clone()),
                _ => None,
            })
            .unwrap();
        let deltas: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::AssistantStreamingMessage {
                    message_id,
                    content,
                    is_complete: false,
                } => {
                    assert_eq!(*message_id, final_id);
                    Some(content.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("c1", "echo", r#"{"text":"ping"}"#),
            text("Done"),
        ]));
        let agent = agent(provider.clone())
            .with_tool(echo_tool())
            .build()
            .unwrap();

        let outcome = agent.run(RunOptions::new("echo ping")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls_made, 1);

        let results = recorded_results(&agent);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, json!({ "echo": "ping" }));

        // The second request carries the call and its result
        let requests = provider.requests();
        let second = &requests[1].messages;
        assert!(second.iter().any(|m| m.role == Role::Assistant && m.tool_calls.len() == 1));
        assert!(second.iter().any(|m| m.tool_call_id.as_deref() == Some("c1")));
    }

    #[tokio::test]
    async fn iteration_cap_stops_after_one_request() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("c1", "echo", r#"{"text":"a"}"#),
            tool_call("c2", "echo", r#"{"text":"b"}"#),
        ]));
        let agent = agent(provider.clone())
            .with_tool(echo_tool())
            .with_max_iterations(1)
            .build()
            .unwrap();

        let outcome = agent.run(RunOptions::new("loop")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::MaxIterations);
        assert_eq!(outcome.final_content, None);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(agent.status(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn unknown_tool_and_invalid_arguments_become_error_results() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let strict = Arc::new(FunctionTool::new(
            "strict",
            "Needs a path",
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
            move |_args: Value| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("ran"))
                }
            },
        ));
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_calls(&[
                ("c1", "strict", "{}"),
                ("c2", "nope", "{}"),
                ("c3", "strict", "not json"),
            ]),
            text("ok"),
        ]));
        let agent = agent(provider).with_tool(strict).build().unwrap();

        let outcome = agent.run(RunOptions::new("go")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let results = recorded_results(&agent);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(ToolResult::is_error));
        assert!(results[0].error.as_deref().unwrap().contains("path"));
        assert!(results[1].error.as_deref().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn tool_errors_do_not_end_the_run() {
        let failing = Arc::new(FunctionTool::new(
            "flaky",
            "Always fails",
            json!({ "type": "object", "properties": {} }),
            |_args: Value| async move {
                Err(ToolError::ExecutionFailed {
                    tool_name: "flaky".into(),
                    reason: "disk full".into(),
                })
            },
        ));
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("c1", "flaky", "{}"),
            text("gave up"),
        ]));
        let agent = agent(provider).with_tool(failing).build().unwrap();

        let outcome = agent.run(RunOptions::new("go")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        let results = recorded_results(&agent);
        assert!(results[0].error.as_deref().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn parallel_results_follow_model_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_calls(&[("c1", "slow", "{}"), ("c2", "fast", "{}")]),
            text("ok"),
        ]));
        let agent = agent(provider)
            .with_tool(sleepy_tool("slow", 30))
            .with_tool(sleepy_tool("fast", 0))
            .with_dispatch(DispatchMode::Parallel)
            .build()
            .unwrap();

        agent.run(RunOptions::new("go")).await.unwrap();

        let events = agent
            .events()
            .get_events_by_type(&[EventType::ToolCall, EventType::ToolResult], None);
        let ids: Vec<(EventType, String)> = events
            .iter()
            .map(|e| match &e.kind {
                EventKind::ToolCall { tool_call_id, .. } | EventKind::ToolResult { tool_call_id, .. } => {
                    (e.event_type(), tool_call_id.clone())
                }
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            ids,
            vec![
                (EventType::ToolCall, "c1".to_string()),
                (EventType::ToolCall, "c2".to_string()),
                (EventType::ToolResult, "c1".to_string()),
                (EventType::ToolResult, "c2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn transient_error_is_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Reply::Fail(ProviderError::Timeout("slow upstream".into())),
            text("recovered"),
        ]));
        let agent = agent(provider.clone()).build().unwrap();

        let outcome = agent.run(RunOptions::new("hi")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_content.as_deref(), Some("recovered"));
        assert_eq!(provider.call_count(), 2);

        let warnings: Vec<Event> = agent
            .events()
            .get_events_by_type(&[EventType::System], None);
        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            &warnings[0].kind,
            EventKind::System { level: SystemLevel::Warning, details: Some(d), .. } if d["attempt"] == 1
        ));
    }

    #[tokio::test]
    async fn mid_stream_failure_is_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Reply::FailMidStream(
                vec![StreamChunk::text("partial")],
                ProviderError::StreamInterrupted("reset".into()),
            ),
            text("whole answer"),
        ]));
        let agent = agent(provider.clone()).build().unwrap();

        let outcome = agent.run(RunOptions::new("hi")).await.unwrap();
        assert_eq!(outcome.final_content.as_deref(), Some("whole answer"));
        assert_eq!(provider.call_count(), 2);
        assert_eq!(count(&agent.events().get_events(None, None), EventType::AssistantMessage), 1);
    }

    #[tokio::test]
    async fn non_transient_error_ends_with_error_status() {
        let provider = Arc::new(ScriptedProvider::new(vec![Reply::Fail(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let agent = agent(provider.clone()).build().unwrap();

        let outcome = agent.run(RunOptions::new("hi")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(agent.status(), AgentStatus::Error);

        let events = agent.events().get_events(None, None);
        let system = events
            .iter()
            .rev()
            .find(|e| e.event_type() == EventType::System)
            .unwrap();
        assert!(matches!(&system.kind, EventKind::System { level: SystemLevel::Error, message, .. } if message.contains("bad key")));
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(EventKind::AgentRunEnd { status: RunStatus::Error, .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_retries_end_with_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Reply::Fail(ProviderError::Network("down".into())),
            Reply::Fail(ProviderError::Network("down".into())),
            Reply::Fail(ProviderError::Network("down".into())),
        ]));
        let agent = agent(provider.clone()).build().unwrap();

        let outcome = agent.run(RunOptions::new("hi")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Error);
        // One attempt plus two retries
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn engine_finalize_failure_degrades_to_content() {
        use toolwright_engine::{EngineError, NativeEngine, StreamProcessingState};

        struct Stubborn(NativeEngine);

        impl ToolCallEngine for Stubborn {
            fn kind(&self) -> ToolCallEngineKind {
                self.0.kind()
            }
            fn prepare_system_prompt(&self, base: &str, tools: &[ToolDefinition]) -> String {
                self.0.prepare_system_prompt(base, tools)
            }
            fn prepare_request(&self, context: PrepareRequestContext) -> ProviderRequest {
                self.0.prepare_request(context)
            }
            fn process_chunk(
                &self,
                chunk: &StreamChunk,
                state: &mut StreamProcessingState,
            ) -> ChunkOutcome {
                self.0.process_chunk(chunk, state)
            }
            fn finalize(&self, _state: StreamProcessingState) -> Result<ParsedModelResponse, EngineError> {
                Err(EngineError::Unrecoverable("garbled".into()))
            }
            fn build_assistant_message(&self, response: &ParsedModelResponse) -> Message {
                self.0.build_assistant_message(response)
            }
            fn build_tool_result_messages(&self, results: &[ToolResult]) -> Vec<Message> {
                self.0.build_tool_result_messages(results)
            }
        }

        let provider = Arc::new(ScriptedProvider::new(vec![text("raw text")]));
        let agent = agent(provider)
            .with_engine(Arc::new(Stubborn(NativeEngine::new())))
            .build()
            .unwrap();

        let outcome = agent.run(RunOptions::new("hi")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_content.as_deref(), Some("raw text"));
        let system = agent.events().get_events_by_type(&[EventType::System], None);
        assert!(matches!(&system[0].kind, EventKind::System { level: SystemLevel::Warning, .. }));
    }

    #[tokio::test]
    async fn termination_hook_can_veto_once() {
        struct VetoOnce(AtomicBool);

        #[async_trait::async_trait]
        impl AgentHooks for VetoOnce {
            async fn before_loop_termination(
                &self,
                _ctx: &HookContext,
                _response: &ParsedModelResponse,
            ) -> TerminationDecision {
                if self.0.swap(true, Ordering::SeqCst) {
                    TerminationDecision::Finish
                } else {
                    TerminationDecision::Continue {
                        message: "Double-check the answer.".into(),
                    }
                }
            }
        }

        let provider = Arc::new(ScriptedProvider::new(vec![text("first"), text("second")]));
        let agent = agent(provider.clone())
            .with_hook(Arc::new(VetoOnce(AtomicBool::new(false))))
            .build()
            .unwrap();

        let outcome = agent.run(RunOptions::new("hi")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.final_content.as_deref(), Some("second"));

        let second = &provider.requests()[1].messages;
        assert!(second
            .iter()
            .any(|m| m.role == Role::User && m.content == "Double-check the answer."));
    }

    #[tokio::test]
    async fn hooks_observe_the_lifecycle() {
        #[derive(Default)]
        struct Recorder {
            starts: AtomicUsize,
            tool_results: AtomicUsize,
            ends: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl AgentHooks for Recorder {
            async fn before_loop_start(&self, _ctx: &HookContext) {
                self.starts.fetch_add(1, Ordering::SeqCst);
            }
            async fn after_tool_call(&self, ctx: &HookContext, _call: &ToolCall, _result: &ToolResult) {
                // Results are published after the hooks run
                assert!(ctx.events.get_latest_tool_results().is_empty());
                self.tool_results.fetch_add(1, Ordering::SeqCst);
            }
            async fn loop_end(&self, _ctx: &HookContext, outcome: &RunOutcome) {
                assert_eq!(outcome.status, RunStatus::Completed);
                self.ends.fetch_add(1, Ordering::SeqCst);
            }
        }

        let recorder = Arc::new(Recorder::default());
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("c1", "echo", r#"{"text":"x"}"#),
            text("done"),
        ]));
        let agent = agent(provider)
            .with_tool(echo_tool())
            .with_hook(recorder.clone())
            .build()
            .unwrap();

        agent.run(RunOptions::new("go")).await.unwrap();
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.tool_results.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_issues_no_request() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("never")]));
        let agent = agent(provider.clone()).build().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = agent
            .run(RunOptions::new("hi").with_cancel(cancel))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(provider.call_count(), 0);
        assert_eq!(agent.status(), AgentStatus::Aborted);
        assert!(matches!(
            agent.events().get_events(None, None).last().map(|e| &e.kind),
            Some(EventKind::AgentRunEnd { status: RunStatus::Aborted, .. })
        ));
    }

    #[tokio::test]
    async fn long_response_does_not_evict_the_task() {
        let mut chunks: Vec<StreamChunk> = (0..120).map(|_| StreamChunk::text("word ")).collect();
        chunks.push(StreamChunk {
            tool_calls: vec![toolwright_core::provider::ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("echo".into()),
                arguments: Some(r#"{"text":"x"}"#.into()),
            }],
            finish_reason: Some("tool_calls".into()),
            done: true,
            ..Default::default()
        });
        let provider = Arc::new(ScriptedProvider::new(vec![
            Reply::Chunks(chunks),
            text("done"),
        ]));
        let events = Arc::new(EventStream::new(EventStreamOptions {
            max_events: 50,
            auto_trim: true,
        }));
        let agent = agent(provider.clone())
            .with_tool(echo_tool())
            .with_event_stream(events)
            .build()
            .unwrap();

        let outcome = agent.run(RunOptions::new("summarize the report")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);

        let requests = provider.requests();
        let second = &requests[1].messages;
        assert!(second
            .iter()
            .any(|m| m.role == Role::User && m.content == "summarize the report"));
        assert!(second.iter().any(|m| m.tool_call_id.as_deref() == Some("c1")));
        let log = agent.events().get_events(None, None);
        assert!(log.len() <= 50);
        assert_eq!(count(&log, EventType::UserMessage), 1);
    }

    /// Ignores its context's token, sleeps, then records that it finished.
    fn stubborn_tool(name: &'static str, millis: u64, done: Arc<AtomicUsize>) -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            name,
            "Sleeps without watching for cancellation",
            json!({ "type": "object", "properties": {} }),
            move |_args: Value| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("finished"))
                }
            },
        ))
    }

    fn cancel_after(millis: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test]
    async fn cancelled_dispatch_lets_running_tools_settle() {
        let done = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("c1", "slow", "{}"),
            text("never requested"),
        ]));
        let agent = agent(provider.clone())
            .with_tool(stubborn_tool("slow", 80, done.clone()))
            .build()
            .unwrap();

        let outcome = agent
            .run(RunOptions::new("go").with_cancel(cancel_after(20)))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(provider.call_count(), 1);

        // The settled result is discarded
        let events = agent.events().get_events(None, None);
        assert_eq!(count(&events, EventType::ToolCall), 1);
        assert_eq!(count(&events, EventType::ToolResult), 0);
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(EventKind::AgentRunEnd { status: RunStatus::Aborted, .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_sequential_dispatch_starts_no_further_tools() {
        let done = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(ScriptedProvider::new(vec![tool_calls(&[
            ("c1", "first", "{}"),
            ("c2", "second", "{}"),
        ])]));
        let agent = agent(provider)
            .with_tool(stubborn_tool("first", 60, done.clone()))
            .with_tool(stubborn_tool("second", 0, done.clone()))
            .with_dispatch(DispatchMode::Sequential)
            .build()
            .unwrap();

        let outcome = agent
            .run(RunOptions::new("go").with_cancel(cancel_after(20)))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected_and_abort_stops_the_first() {
        let provider = Arc::new(ScriptedProvider::new(vec![Reply::Hang(vec![
            StreamChunk::text("thinking..."),
        ])]));
        let agent = Arc::new(agent(provider.clone()).build().unwrap());

        let mut stream = agent.run_streaming(RunOptions::new("first")).unwrap();
        // Wait until the model is mid-answer
        while let Some(event) = stream.next().await {
            if event.event_type() == EventType::AssistantStreamingMessage {
                break;
            }
        }
        assert!(agent.status().is_busy());
        assert!(matches!(
            agent.run(RunOptions::new("second")).await,
            Err(AgentError::AlreadyRunning)
        ));

        agent.abort();
        let outcome = stream.outcome().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(agent.status(), AgentStatus::Aborted);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(count(&agent.events().get_events(None, None), EventType::AssistantMessage), 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_run() {
        let provider = Arc::new(ScriptedProvider::new(vec![Reply::Hang(vec![
            StreamChunk::text("partial"),
        ])]));
        let agent = Arc::new(agent(provider).build().unwrap());

        let mut stream = agent.run_streaming(RunOptions::new("hi")).unwrap();
        while let Some(event) = stream.next().await {
            if event.event_type() == EventType::AssistantStreamingMessage {
                break;
            }
        }
        drop(stream);

        for _ in 0..200 {
            if !agent.status().is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(agent.status(), AgentStatus::Aborted);
    }

    #[tokio::test]
    async fn panicking_run_still_ends_the_stream() {
        struct Explodes;

        #[async_trait::async_trait]
        impl AgentHooks for Explodes {
            async fn before_loop_start(&self, _ctx: &HookContext) {
                panic!("hook blew up");
            }
        }

        let provider = Arc::new(ScriptedProvider::new(vec![text("unused")]));
        let agent = Arc::new(agent(provider).with_hook(Arc::new(Explodes)).build().unwrap());

        let mut stream = agent.run_streaming(RunOptions::new("hi")).unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while stream.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "event stream never ended");
        assert!(matches!(stream.outcome().await, Err(AgentError::Join(_))));
        assert_eq!(agent.status(), AgentStatus::Error);
    }

    #[tokio::test]
    async fn streamed_run_ends_after_run_end_event() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("hi back")]));
        let agent = Arc::new(agent(provider).build().unwrap());

        let stream = agent
            .run_streaming(RunOptions::new("hi").with_context("screen: blank"))
            .unwrap();
        let events: Vec<Event> = stream.collect().await;
        let kinds = types(&events);
        assert_eq!(kinds.first(), Some(&EventType::AgentRunStart));
        assert_eq!(kinds.last(), Some(&EventType::AgentRunEnd));
        assert_eq!(count(&events, EventType::EnvironmentInput), 1);
    }

    #[tokio::test]
    async fn duplicate_tool_names_are_rejected_at_build() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let result = agent(provider)
            .with_tool(echo_tool())
            .with_tool(echo_tool())
            .build();
        assert!(matches!(
            result,
            Err(AgentError::Tool(ToolError::DuplicateName(name))) if name == "echo"
        ));
    }

    #[tokio::test]
    async fn planner_tool_clashing_with_agent_tool_is_rejected() {
        let clash = Arc::new(FunctionTool::new(
            "create_plan",
            "Not the planner's",
            json!({ "type": "object", "properties": {} }),
            |_args: Value| async move { Ok(json!(null)) },
        ));
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let result = agent(provider)
            .with_tool(clash)
            .with_planner(Arc::new(DefaultStrategy))
            .build();
        assert!(matches!(result, Err(AgentError::Tool(ToolError::DuplicateName(_)))));
    }

    #[tokio::test]
    async fn planner_gates_tools_by_stage() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("p1", "create_plan", r#"{"steps":["echo something"]}"#),
            tool_call("c1", "echo", r#"{"text":"something"}"#),
            text("all done"),
        ]));
        let agent = agent(provider.clone())
            .with_tool(echo_tool())
            .with_planner(Arc::new(DefaultStrategy))
            .build()
            .unwrap();

        let outcome = agent.run(RunOptions::new("echo something")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);

        let requests = provider.requests();
        let names = |i: usize| -> Vec<String> {
            requests[i].tools.iter().map(|t| t.name.clone()).collect()
        };
        assert_eq!(names(0), vec!["create_plan"]);
        assert!(names(1).contains(&"echo".to_string()));
        assert!(!names(1).contains(&"create_plan".to_string()));

        let events = agent.events().get_events(None, None);
        assert_eq!(count(&events, EventType::PlanStart), 1);
        assert!(count(&events, EventType::PlanUpdate) >= 1);
        assert_eq!(agent.planner().unwrap().state().steps.len(), 1);
    }

    #[tokio::test]
    async fn reasoning_is_published_as_thinking() {
        let provider = Arc::new(ScriptedProvider::new(vec![Reply::Chunks(vec![
            StreamChunk {
                reasoning_content: Some("let me think".into()),
                ..Default::default()
            },
            StreamChunk::text("answer"),
        ])]));
        let agent = agent(provider).build().unwrap();
        agent.run(RunOptions::new("hi")).await.unwrap();

        let events = agent.events().get_events(None, None);
        assert_eq!(count(&events, EventType::AssistantThinkingMessage), 1);
        assert!(count(&events, EventType::AssistantStreamingThinkingMessage) >= 1);
    }

    #[tokio::test]
    async fn later_runs_see_earlier_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("one"), text("two")]));
        let agent = agent(provider.clone()).build().unwrap();

        agent.run(RunOptions::new("first")).await.unwrap();
        agent.run(RunOptions::new("second")).await.unwrap();

        let second = &provider.requests()[1].messages;
        let contents: Vec<&str> = second.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&contents[1..], &["first", "one", "second"]);
    }

}
