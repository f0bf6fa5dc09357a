//! Conversation engine — wires assembler, graph and encoder into one turn.

use crate::context::{AssembledPrompt, AssemblyInput, ContextAssembler};
use crate::encoder::EventEncoder;
use crate::executor::ToolExecutor;
use crate::graph::{ExecutionContext, ExecutionGraph};
use chrono::Utc;
use parley_config::AppConfig;
use parley_core::document::FileEntry;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::Message;
use parley_core::profile::Profile;
use parley_core::provider::Provider;
use parley_core::stream::StreamEvent;
use parley_core::tool::ToolRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

/// Everything needed to run one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub thread_id: String,
    pub org_id: String,
    pub user_id: String,
    /// Persisted thread history, oldest first.
    pub history: Vec<Message>,
    pub user_message: Message,
    pub files: Vec<FileEntry>,
    pub profile: Profile,
}

/// Runs turns and streams their wire events. Cheap to clone and share.
#[derive(Clone)]
pub struct ConversationEngine {
    graph: ExecutionGraph,
    assembler: ContextAssembler,
    system_prompt: String,
}

impl ConversationEngine {
    pub fn new(graph: ExecutionGraph, assembler: ContextAssembler) -> Self {
        Self {
            graph,
            assembler,
            system_prompt: String::new(),
        }
    }

    pub fn from_config(config: &AppConfig, provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>) -> Self {
        let executor = ToolExecutor::from_config(tools, &config.engine);
        let graph = ExecutionGraph::from_config(provider, executor, config);
        Self::new(graph, ContextAssembler::from_config(&config.context))
            .with_system_prompt(config.engine.system_prompt.clone())
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.graph = self.graph.with_event_bus(bus);
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.graph.event_bus()
    }

    /// Build the prompt for a turn. Pure.
    pub fn assemble(&self, request: &TurnRequest) -> AssembledPrompt {
        let fields = request.profile.fields();
        self.assembler.assemble(&AssemblyInput {
            system_prompt: &self.system_prompt,
            profile_fields: &fields,
            files: &request.files,
            history: &request.history,
            user_message: &request.user_message,
        })
    }

    /// Start a turn in the background and return its event stream.
    ///
    /// The stream always ends with exactly one `done` or `error`. Dropping
    /// the receiver, or cancelling `cancel`, aborts the turn.
    pub fn run_stream(&self, request: TurnRequest, cancel: CancellationToken) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(128);
        let engine = self.clone();
        let span = info_span!("turn", thread_id = %request.thread_id, org_id = %request.org_id);
        tokio::spawn(async move { engine.drive_turn(request, tx, cancel).await }.instrument(span));
        rx
    }

    /// Run a turn to completion and collect every event.
    pub async fn collect_turn(&self, request: TurnRequest) -> Vec<StreamEvent> {
        let mut rx = self.run_stream(request, CancellationToken::new());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn drive_turn(self, request: TurnRequest, tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken) {
        let prompt = self.assemble(&request);
        info!(
            user_id = %request.user_id,
            estimated_tokens = prompt.metadata.estimated_tokens,
            history_dropped = prompt.metadata.history_dropped,
            files_dropped = prompt.metadata.files_dropped,
            "Turn started"
        );
        self.event_bus().publish(DomainEvent::TurnStarted {
            thread_id: request.thread_id.clone(),
            org_id: request.org_id.clone(),
            timestamp: Utc::now(),
        });

        let mut ctx = ExecutionContext::new(request.thread_id, prompt.messages);
        let (step_tx, mut step_rx) = mpsc::channel(64);

        let forward_cancel = cancel.clone();
        let forward = async move {
            let mut encoder = EventEncoder::new();
            loop {
                // A blocked model or tool call sends nothing, so watch the receiver directly
                let step = tokio::select! {
                    _ = tx.closed() => None,
                    step = step_rx.recv() => match step {
                        Some(step) => Some(step),
                        None => return,
                    },
                };
                let Some(step) = step else {
                    debug!("Event receiver dropped, cancelling turn");
                    forward_cancel.cancel();
                    return;
                };
                for event in encoder.encode(step) {
                    if tx.send(event).await.is_err() {
                        debug!("Event receiver dropped, cancelling turn");
                        forward_cancel.cancel();
                        return;
                    }
                }
            }
        };

        let (_, ()) = tokio::join!(self.graph.run(&mut ctx, step_tx, &cancel), forward);
    }
}
