//! Conversation state machine.
//!
//! Synchronous and IO-free: every transition returns what the caller must
//! do (render, persist, surface an error). The [`TurnDriver`](crate::TurnDriver)
//! performs the IO.

use parley_core::message::Message;
use parley_core::stream::StreamEvent;
use parley_core::tool::ToolOutput;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("a turn is already streaming")]
    TurnInProgress,

    #[error("message is empty")]
    EmptyMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Streaming,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolBlockStatus {
    Running,
    Succeeded,
    Failed,
}

/// A tool call as displayed in the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolBlock {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub status: ToolBlockStatus,
    pub output: Option<ToolOutput>,
}

impl ToolBlock {
    /// One-line rendering: "in progress" until the result arrives.
    pub fn render(&self) -> String {
        match (&self.status, &self.output) {
            (ToolBlockStatus::Running, _) => format!("[{}] in progress…", self.name),
            (ToolBlockStatus::Succeeded, Some(out)) => format!("[{}] {}", self.name, out.as_text()),
            (ToolBlockStatus::Failed, Some(out)) => format!("[{}] failed: {}", self.name, out.as_text()),
            (_, None) => format!("[{}] interrupted", self.name),
        }
    }
}

/// What applying one event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Visible state changed; re-render.
    Updated,
    /// The event did not apply (no turn in progress, unmatched call id).
    Ignored,
    /// The turn completed; this assistant message must be persisted.
    Finalized(Message),
    /// The turn failed with this message.
    Aborted(String),
}

/// One thread's transcript as the client sees it.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    thread_id: String,
    org_id: String,
    /// Confirmed messages plus optimistic user messages, in display order.
    transcript: Vec<Message>,
    /// The optimistic user message of the turn in progress.
    pending: Option<String>,
    phase: TurnPhase,
    streaming: String,
    /// Tool blocks of the current turn; `block_index` maps call id to position.
    blocks: Vec<ToolBlock>,
    block_index: HashMap<String, usize>,
    error: Option<String>,
    notices: Vec<String>,
}

impl ConversationSession {
    pub fn new(thread_id: impl Into<String>, org_id: impl Into<String>, history: Vec<Message>) -> Self {
        Self {
            thread_id: thread_id.into(),
            org_id: org_id.into(),
            transcript: history,
            pending: None,
            phase: TurnPhase::Idle,
            streaming: String::new(),
            blocks: Vec::new(),
            block_index: HashMap::new(),
            error: None,
            notices: Vec::new(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    /// The optimistic user message awaiting its turn, if any.
    pub fn pending(&self) -> Option<&Message> {
        let id = self.pending.as_deref()?;
        self.transcript.iter().rev().find(|m| m.id == id)
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == TurnPhase::Streaming
    }

    /// Assistant text received so far in the current turn.
    pub fn streaming_text(&self) -> &str {
        &self.streaming
    }

    pub fn tool_blocks(&self) -> &[ToolBlock] {
        &self.blocks
    }

    pub fn tool_block(&self, call_id: &str) -> Option<&ToolBlock> {
        self.block_index.get(call_id).map(|&i| &self.blocks[i])
    }

    /// Inline error of the last failed turn.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Save-failure notices.
    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// Start a turn: show the user message immediately and return it for
    /// persistence and sending.
    pub fn submit(&mut self, text: &str) -> Result<Message, StateError> {
        if self.is_streaming() {
            return Err(StateError::TurnInProgress);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(StateError::EmptyMessage);
        }

        let message = Message::user(text);
        self.transcript.push(message.clone());
        self.pending = Some(message.id.clone());
        self.phase = TurnPhase::Streaming;
        self.streaming.clear();
        self.blocks.clear();
        self.block_index.clear();
        self.error = None;
        Ok(message)
    }

    /// History to send with the pending turn: everything before the
    /// optimistic message.
    pub fn request_history(&self) -> Vec<Message> {
        self.transcript
            .iter()
            .filter(|m| Some(&m.id) != self.pending.as_ref())
            .cloned()
            .collect()
    }

    pub fn apply(&mut self, event: StreamEvent) -> Applied {
        if !self.is_streaming() {
            warn!(event_type = event.event_type(), "Event outside of a turn ignored");
            return Applied::Ignored;
        }

        match event {
            StreamEvent::Token { text } => {
                self.streaming.push_str(&text);
                Applied::Updated
            }
            StreamEvent::ToolStart {
                call_id,
                name,
                arguments,
            } => {
                if self.block_index.contains_key(&call_id) {
                    warn!(%call_id, "Duplicate tool_start ignored");
                    return Applied::Ignored;
                }
                self.block_index.insert(call_id.clone(), self.blocks.len());
                self.blocks.push(ToolBlock {
                    call_id,
                    name,
                    arguments,
                    status: ToolBlockStatus::Running,
                    output: None,
                });
                Applied::Updated
            }
            StreamEvent::ToolEnd {
                call_id,
                output,
                is_error,
                ..
            } => match self.block_index.get(&call_id) {
                Some(&index) => {
                    let block = &mut self.blocks[index];
                    block.status = if is_error {
                        ToolBlockStatus::Failed
                    } else {
                        ToolBlockStatus::Succeeded
                    };
                    block.output = Some(output);
                    Applied::Updated
                }
                None => {
                    warn!(%call_id, "tool_end without a tool block ignored");
                    Applied::Ignored
                }
            },
            StreamEvent::Error { message } => self.abort(message),
            StreamEvent::Done => {
                let message = Message::assistant(std::mem::take(&mut self.streaming));
                self.transcript.push(message.clone());
                self.pending = None;
                self.phase = TurnPhase::Idle;
                Applied::Finalized(message)
            }
        }
    }

    /// The transport broke before a terminal event.
    pub fn transport_failed(&mut self, reason: impl Into<String>) -> Applied {
        if !self.is_streaming() {
            return Applied::Ignored;
        }
        self.abort(reason.into())
    }

    /// Record that a message could not be saved. The transcript is unchanged.
    pub fn persist_failed(&mut self, message: &Message, reason: impl std::fmt::Display) {
        self.notices.push(format!(
            "Your {} message could not be saved: {reason}",
            message.role.as_str()
        ));
    }

    fn abort(&mut self, message: String) -> Applied {
        // The optimistic message stays: it is already persisted.
        self.pending = None;
        self.phase = TurnPhase::Failed;
        self.streaming.clear();
        for block in self.blocks.iter_mut().filter(|b| b.status == ToolBlockStatus::Running) {
            block.status = ToolBlockStatus::Failed;
        }
        self.error = Some(message.clone());
        Applied::Aborted(message)
    }
}
