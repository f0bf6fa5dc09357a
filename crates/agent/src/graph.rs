//! The execution graph — the agent/tool loop of one turn.
//!
//! ```text
//!            tool calls            all results in
//!   AGENT ───────────────► TOOLS ─────────────────► AGENT
//!     │
//!     ├── no tool calls ──► DONE
//!     └── model failure, iteration cap, timeout, cancel ──► FAILED
//! ```
//!
//! Tool failures never leave the loop: they come back to the model as
//! error results. Only a failed model invocation (or a turn-level guard)
//! ends the turn early.

use crate::executor::ToolExecutor;
use chrono::Utc;
use futures::StreamExt;
use parley_config::AppConfig;
use parley_core::error::ProviderError;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::Message;
use parley_core::provider::{Provider, ProviderRequest};
use parley_core::tool::{ToolCall, ToolResult};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a turn ended in `FAILED`.
#[derive(Debug, Clone, Error)]
pub enum TurnError {
    #[error("Model invocation failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Exceeded {0} model invocations in one turn")]
    MaxIterations(u32),

    #[error("Turn timed out after {0}s")]
    Timeout(u64),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Event consumer disconnected")]
    Disconnected,
}

/// Where the graph is.
#[derive(Debug, Clone)]
pub enum GraphState {
    Agent,
    Tools(Vec<ToolCall>),
    Done,
    Failed(TurnError),
}

impl GraphState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GraphState::Done | GraphState::Failed(_))
    }
}

/// Observable progress of the graph, in causal order.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphStep {
    /// A text delta from the model.
    TokenDelta(String),
    /// The graph entered `TOOLS` with this batch.
    ToolsRequested(Vec<ToolCall>),
    /// One call of the current batch finished.
    ToolFinished(ToolResult),
    /// The graph reached `DONE`. `content` is every delta of the turn concatenated.
    Completed { content: String },
    /// The graph reached `FAILED`.
    Failed { message: String },
}

/// Per-turn working state. Created fresh for every turn and discarded after.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub thread_id: String,
    /// The prompt plus this turn's assistant and tool traffic.
    pub messages: Vec<Message>,
    pub state: GraphState,
    /// Model invocations so far.
    pub iteration: u32,
    /// Every text delta of the turn, concatenated.
    pub content: String,
    pub tool_calls_executed: usize,
}

impl ExecutionContext {
    pub fn new(thread_id: impl Into<String>, prompt: Vec<Message>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: prompt,
            state: GraphState::Agent,
            iteration: 0,
            content: String::new(),
            tool_calls_executed: 0,
        }
    }
}

/// Summary of a turn that reached `DONE`.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub content: String,
    pub iterations: u32,
    pub tool_calls: usize,
}

/// The agent/tool loop. Cheap to clone; holds no per-turn state.
#[derive(Clone)]
pub struct ExecutionGraph {
    provider: Arc<dyn Provider>,
    executor: ToolExecutor,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    max_iterations: u32,
    turn_timeout: Duration,
    event_bus: Arc<EventBus>,
}

impl ExecutionGraph {
    pub fn new(provider: Arc<dyn Provider>, executor: ToolExecutor, model: impl Into<String>) -> Self {
        Self {
            provider,
            executor,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            max_iterations: 10,
            turn_timeout: Duration::from_secs(300),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    pub fn from_config(provider: Arc<dyn Provider>, executor: ToolExecutor, config: &AppConfig) -> Self {
        Self::new(provider, executor, config.model.clone())
            .with_temperature(config.temperature)
            .with_max_tokens(Some(config.max_tokens))
            .with_max_iterations(config.engine.max_iterations)
            .with_turn_timeout(Duration::from_secs(config.engine.turn_timeout_secs))
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Cap on `AGENT` visits per turn.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run the turn to a terminal state.
    ///
    /// Every step is sent on `steps`; the last one is always `Completed` or
    /// `Failed`. Cancelling `cancel` aborts the in-flight model stream and
    /// tool batch.
    pub async fn run(
        &self,
        ctx: &mut ExecutionContext,
        steps: mpsc::Sender<GraphStep>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let timeout_secs = self.turn_timeout.as_secs();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TurnError::Cancelled),
            r = tokio::time::timeout(self.turn_timeout, self.drive(ctx, &steps)) => {
                r.unwrap_or(Err(TurnError::Timeout(timeout_secs)))
            }
        };

        match result {
            Ok(()) => {
                ctx.state = GraphState::Done;
                info!(
                    thread_id = %ctx.thread_id,
                    iterations = ctx.iteration,
                    tool_calls = ctx.tool_calls_executed,
                    "Turn completed"
                );
                self.event_bus.publish(DomainEvent::TurnCompleted {
                    thread_id: ctx.thread_id.clone(),
                    iterations: ctx.iteration,
                    tool_calls: ctx.tool_calls_executed,
                    timestamp: Utc::now(),
                });
                let _ = steps
                    .send(GraphStep::Completed {
                        content: ctx.content.clone(),
                    })
                    .await;
                Ok(TurnOutcome {
                    content: ctx.content.clone(),
                    iterations: ctx.iteration,
                    tool_calls: ctx.tool_calls_executed,
                })
            }
            Err(err) => {
                ctx.state = GraphState::Failed(err.clone());
                warn!(thread_id = %ctx.thread_id, iteration = ctx.iteration, error = %err, "Turn failed");
                self.event_bus.publish(DomainEvent::TurnFailed {
                    thread_id: ctx.thread_id.clone(),
                    error_message: err.to_string(),
                    timestamp: Utc::now(),
                });
                let _ = steps
                    .send(GraphStep::Failed {
                        message: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn drive(&self, ctx: &mut ExecutionContext, steps: &mpsc::Sender<GraphStep>) -> Result<(), TurnError> {
        loop {
            let next = match std::mem::replace(&mut ctx.state, GraphState::Agent) {
                GraphState::Agent => self.agent_step(ctx, steps).await?,
                GraphState::Tools(calls) => self.tools_step(ctx, calls, steps).await?,
                GraphState::Done => return Ok(()),
                GraphState::Failed(err) => return Err(err),
            };
            ctx.state = next;
        }
    }

    /// Invoke the model once and decide between `TOOLS` and `DONE`.
    async fn agent_step(
        &self,
        ctx: &mut ExecutionContext,
        steps: &mpsc::Sender<GraphStep>,
    ) -> Result<GraphState, TurnError> {
        ctx.iteration += 1;
        if ctx.iteration > self.max_iterations {
            return Err(TurnError::MaxIterations(self.max_iterations));
        }

        let request = ProviderRequest {
            model: self.model.clone(),
            messages: ctx.messages.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: self.executor.registry().definitions(),
        };

        debug!(thread_id = %ctx.thread_id, iteration = ctx.iteration, "Invoking model");
        self.event_bus.publish(DomainEvent::ModelInvoked {
            thread_id: ctx.thread_id.clone(),
            iteration: ctx.iteration,
            model: self.model.clone(),
            timestamp: Utc::now(),
        });

        let mut chunks = self.provider.stream(request).await?;
        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();

        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                text.push_str(&delta);
                ctx.content.push_str(&delta);
                send(steps, GraphStep::TokenDelta(delta)).await?;
            }
            for call in chunk.tool_calls {
                merge_call(&mut calls, call, ctx.iteration);
            }
            if chunk.done {
                break;
            }
        }

        ctx.messages.push(Message::assistant(text).with_tool_calls(calls.clone()));

        if calls.is_empty() {
            Ok(GraphState::Done)
        } else {
            debug!(thread_id = %ctx.thread_id, count = calls.len(), "Model requested tools");
            Ok(GraphState::Tools(calls))
        }
    }

    /// Execute one batch and feed every result back into the context.
    async fn tools_step(
        &self,
        ctx: &mut ExecutionContext,
        calls: Vec<ToolCall>,
        steps: &mpsc::Sender<GraphStep>,
    ) -> Result<GraphState, TurnError> {
        send(steps, GraphStep::ToolsRequested(calls.clone())).await?;

        let mut runs = std::pin::pin!(self.executor.run_batch(&calls));
        while let Some(run) = runs.next().await {
            let result = run.result;
            self.event_bus.publish(DomainEvent::ToolExecuted {
                thread_id: ctx.thread_id.clone(),
                tool_name: result.name.clone(),
                success: !result.is_error,
                duration_ms: run.elapsed.as_millis() as u64,
                timestamp: Utc::now(),
            });
            ctx.tool_calls_executed += 1;

            let text = result.output.as_text();
            let content = if result.is_error { format!("Error: {text}") } else { text };
            ctx.messages.push(Message::tool_result(result.call_id.clone(), content));
            send(steps, GraphStep::ToolFinished(result)).await?;
        }

        Ok(GraphState::Agent)
    }
}

async fn send(steps: &mpsc::Sender<GraphStep>, step: GraphStep) -> Result<(), TurnError> {
    steps.send(step).await.map_err(|_| TurnError::Disconnected)
}

/// Add a completed call to the batch. Calls without an id get a synthetic
/// one; a repeated id replaces the earlier entry.
fn merge_call(calls: &mut Vec<ToolCall>, mut call: ToolCall, iteration: u32) {
    if call.id.is_empty() {
        call.id = format!("call_{iteration}_{}", calls.len());
    }
    match calls.iter_mut().find(|c| c.id == call.id) {
        Some(existing) => {
            if !call.name.is_empty() {
                existing.name = call.name;
            }
            if !call.arguments.is_null() {
                existing.arguments = call.arguments;
            }
        }
        None => calls.push(call),
    }
}
