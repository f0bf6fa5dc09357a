//! Shared test helpers: a scripted model and stub tools.
//!
//! Available to this crate's tests and, with the `testing` feature, to the
//! end-to-end tests of other crates.

use async_trait::async_trait;
use parley_core::error::{ProviderError, ToolError};
use parley_core::message::Message;
use parley_core::provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
use parley_core::tool::{Tool, ToolCall, ToolOutput, ToolRegistry};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the scripted model does on one invocation.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream `tokens`, then finish with `tool_calls` (empty for a final answer).
    Reply { tokens: Vec<String>, tool_calls: Vec<ToolCall> },
    /// Reject the request before streaming anything.
    Fail(ProviderError),
    /// Stream `tokens`, then break the stream with `error`.
    FailMidStream { tokens: Vec<String>, error: ProviderError },
    /// Open the stream and never send anything.
    Hang,
}

impl Script {
    /// A final answer streamed as the given deltas.
    pub fn text(tokens: &[&str]) -> Self {
        Script::Reply {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            tool_calls: Vec::new(),
        }
    }

    /// A tool request with no accompanying text.
    pub fn tools(tool_calls: Vec<ToolCall>) -> Self {
        Script::Reply {
            tokens: Vec::new(),
            tool_calls,
        }
    }
}

/// A provider that plays back one [`Script`] per invocation, in order.
///
/// Every request is recorded so tests can inspect what the model was shown.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers once with the given deltas.
    pub fn single_text(tokens: &[&str]) -> Self {
        Self::new(vec![Script::text(tokens)])
    }

    /// A provider that requests tools once, then answers.
    pub fn tool_then_answer(tool_calls: Vec<ToolCall>, answer: &[&str]) -> Self {
        Self::new(vec![Script::tools(tool_calls), Script::text(answer)])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_script(&self, request: ProviderRequest) -> Option<Script> {
        self.requests.lock().unwrap().push(request);
        self.scripts.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next_script(request) {
            Some(Script::Reply { tokens, tool_calls }) => Ok(ProviderResponse {
                message: Message::assistant(tokens.concat()).with_tool_calls(tool_calls),
                usage: Some(mock_usage()),
                model: "mock-model".into(),
            }),
            Some(Script::Fail(error)) | Some(Script::FailMidStream { error, .. }) => Err(error),
            Some(Script::Hang) => std::future::pending().await,
            None => Err(exhausted()),
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let script = match self.next_script(request) {
            Some(Script::Fail(error)) => return Err(error),
            Some(script) => script,
            None => return Err(exhausted()),
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            match script {
                Script::Reply { tokens, tool_calls } => {
                    for token in tokens {
                        if tx.send(Ok(StreamChunk::text(token))).await.is_err() {
                            return;
                        }
                    }
                    let mut last = StreamChunk::finish(tool_calls);
                    last.usage = Some(mock_usage());
                    let _ = tx.send(Ok(last)).await;
                }
                Script::FailMidStream { tokens, error } => {
                    for token in tokens {
                        if tx.send(Ok(StreamChunk::text(token))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Err(error)).await;
                }
                Script::Hang => tx.closed().await,
                Script::Fail(_) => {}
            }
        });
        Ok(rx)
    }
}

fn exhausted() -> ProviderError {
    ProviderError::NotConfigured("scripted provider has no more responses".into())
}

fn mock_usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

/// How a [`StubTool`] responds.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    Reply(ToolOutput),
    Fail(String),
    Panic,
    /// Sleep, then reply.
    Slow(Duration, ToolOutput),
}

/// A deterministic tool with a `{ "q": string }` schema.
pub struct StubTool {
    name: String,
    behavior: StubBehavior,
}

impl StubTool {
    pub fn new(name: &str, behavior: StubBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
        }
    }

    /// `lookup` answering `{"result":"42"}`.
    pub fn lookup() -> Self {
        Self::new("lookup", StubBehavior::Reply(serde_json::json!({"result": "42"}).into()))
    }

    pub fn failing(name: &str) -> Self {
        Self::new(name, StubBehavior::Fail("backend unavailable".into()))
    }

    pub fn panicking(name: &str) -> Self {
        Self::new(name, StubBehavior::Panic)
    }

    pub fn slow(name: &str, delay: Duration) -> Self {
        Self::new(name, StubBehavior::Slow(delay, ToolOutput::Text(format!("{name} done"))))
    }
}

#[async_trait]
impl Tool for StubTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Deterministic stub tool"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "q": { "type": "string" }
            },
            "required": ["q"]
        })
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        match &self.behavior {
            StubBehavior::Reply(output) => Ok(output.clone()),
            StubBehavior::Fail(reason) => Err(ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: reason.clone(),
            }),
            StubBehavior::Panic => panic!("stub tool '{}' panicked", self.name),
            StubBehavior::Slow(delay, output) => {
                tokio::time::sleep(*delay).await;
                Ok(output.clone())
            }
        }
    }
}

/// Build a shared registry from stub tools.
pub fn registry(tools: Vec<StubTool>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(Box::new(tool));
    }
    Arc::new(registry)
}

/// Helper to create a tool call.
pub fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args,
    }
}
