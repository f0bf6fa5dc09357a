//! Tool executor — runs one batch of model-requested tool calls.
//!
//! Nothing escapes this boundary: unknown tools, schema violations, tool
//! errors, panics and timeouts all become error [`ToolResult`]s that are fed
//! back to the model.

use futures::stream::{self, Stream, StreamExt};
use futures::FutureExt;
use parley_config::EngineConfig;
use parley_core::error::ToolError;
use parley_core::tool::{ToolCall, ToolRegistry, ToolResult};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One finished call with its wall-clock duration.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub result: ToolResult,
    pub elapsed: Duration,
}

/// Executes tool calls against a shared registry with bounded concurrency.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    concurrency: usize,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            concurrency: 4,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(registry: Arc<ToolRegistry>, config: &EngineConfig) -> Self {
        Self::new(registry)
            .with_concurrency(config.tool_concurrency)
            .with_timeout(Duration::from_secs(config.tool_timeout_secs))
    }

    /// Maximum calls of one batch running at the same time (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run a batch. Calls overlap up to the concurrency limit; results are
    /// yielded in batch order regardless of completion order.
    pub fn run_batch<'a>(&'a self, calls: &'a [ToolCall]) -> impl Stream<Item = ToolRun> + 'a {
        stream::iter(calls)
            .map(move |call| self.timed(call))
            .buffered(self.concurrency)
    }

    /// Run a batch to completion.
    pub async fn execute_batch(&self, calls: &[ToolCall]) -> Vec<ToolRun> {
        self.run_batch(calls).collect().await
    }

    async fn timed(&self, call: &ToolCall) -> ToolRun {
        let start = Instant::now();
        let result = self.execute(call).await;
        ToolRun {
            result,
            elapsed: start.elapsed(),
        }
    }

    /// Execute a single call. Never fails.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            let available = self.registry.names();
            warn!(call_id = %call.id, tool = %call.name, "Model requested an unknown tool");
            let available = if available.is_empty() {
                "none".to_string()
            } else {
                available.join(", ")
            };
            return ToolResult::error(
                call,
                format!("{}. Available tools: {available}", ToolError::NotFound(call.name.clone())),
            );
        };

        if let Err(err) = validate_arguments(&tool.parameters_schema(), &call.arguments) {
            warn!(call_id = %call.id, tool = %call.name, error = %err, "Tool arguments rejected");
            return ToolResult::error(call, err.to_string());
        }

        debug!(call_id = %call.id, tool = %call.name, "Executing tool");
        let invocation = AssertUnwindSafe(tool.execute(call.arguments.clone())).catch_unwind();
        match tokio::time::timeout(self.timeout, invocation).await {
            Ok(Ok(Ok(output))) => ToolResult::success(call, output),
            Ok(Ok(Err(err))) => {
                warn!(call_id = %call.id, tool = %call.name, error = %err, "Tool failed");
                ToolResult::error(call, err.to_string())
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                warn!(call_id = %call.id, tool = %call.name, %reason, "Tool panicked");
                let err = ToolError::ExecutionFailed {
                    tool_name: call.name.clone(),
                    reason: format!("panicked: {reason}"),
                };
                ToolResult::error(call, err.to_string())
            }
            Err(_) => {
                warn!(call_id = %call.id, tool = %call.name, "Tool timed out");
                let err = ToolError::Timeout {
                    tool_name: call.name.clone(),
                    timeout_secs: self.timeout.as_secs(),
                };
                ToolResult::error(call, err.to_string())
            }
        }
    }
}

/// Validate arguments against a tool's JSON Schema, collecting every violation.
pub fn validate_arguments(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), ToolError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| ToolError::InvalidArguments(format!("tool schema is invalid: {e}")))?;
    if validator.is_valid(args) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    Err(ToolError::InvalidArguments(errors.join("; ")))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_tool_call, registry, StubTool};
    use parley_core::tool::ToolOutput;
    use serde_json::json;

    fn q() -> serde_json::Value {
        json!({"q": "x"})
    }

    #[tokio::test]
    async fn successful_call_is_correlated() {
        let exec = ToolExecutor::new(registry(vec![StubTool::lookup()]));
        let result = exec.execute(&make_tool_call("c1", "lookup", q())).await;
        assert_eq!(result.call_id, "c1");
        assert_eq!(result.name, "lookup");
        assert!(!result.is_error);
        assert_eq!(result.output, ToolOutput::Json(json!({"result": "42"})));
    }

    #[tokio::test]
    async fn unknown_tool_lists_available_tools() {
        let exec = ToolExecutor::new(registry(vec![StubTool::lookup()]));
        let result = exec.execute(&make_tool_call("c1", "search", q())).await;
        assert!(result.is_error);
        let text = result.output.as_text();
        assert!(text.contains("search"));
        assert!(text.contains("Available tools: lookup"));
    }

    #[tokio::test]
    async fn schema_violation_becomes_error_result() {
        let exec = ToolExecutor::new(registry(vec![StubTool::lookup()]));
        let result = exec.execute(&make_tool_call("c1", "lookup", json!({"q": 7}))).await;
        assert!(result.is_error);
        assert!(result.output.as_text().starts_with("Invalid tool arguments"));

        let result = exec.execute(&make_tool_call("c2", "lookup", json!({}))).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_result() {
        let exec = ToolExecutor::new(registry(vec![StubTool::failing("lookup")]));
        let result = exec.execute(&make_tool_call("c1", "lookup", q())).await;
        assert!(result.is_error);
        assert!(result.output.as_text().contains("backend unavailable"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let exec = ToolExecutor::new(registry(vec![StubTool::panicking("boom")]));
        let result = exec.execute(&make_tool_call("c1", "boom", q())).await;
        assert!(result.is_error);
        assert!(result.output.as_text().contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let exec = ToolExecutor::new(registry(vec![StubTool::slow("slow", Duration::from_secs(60))]))
            .with_timeout(Duration::from_secs(5));
        let result = exec.execute(&make_tool_call("c1", "slow", q())).await;
        assert!(result.is_error);
        assert!(result.output.as_text().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_results_follow_batch_order() {
        let exec = ToolExecutor::new(registry(vec![
            StubTool::slow("slow", Duration::from_secs(3)),
            StubTool::lookup(),
        ]));
        let calls = vec![
            make_tool_call("a", "slow", q()),
            make_tool_call("b", "lookup", q()),
            make_tool_call("c", "missing", q()),
        ];
        let runs = exec.execute_batch(&calls).await;
        let ids: Vec<&str> = runs.iter().map(|r| r.result.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(!runs[0].result.is_error);
        assert!(runs[2].result.is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_overlap_up_to_the_limit() {
        let tools = || registry(vec![StubTool::slow("slow", Duration::from_secs(1))]);
        let calls: Vec<ToolCall> = (0..4).map(|i| make_tool_call(&format!("c{i}"), "slow", q())).collect();

        let start = tokio::time::Instant::now();
        ToolExecutor::new(tools()).with_concurrency(4).execute_batch(&calls).await;
        assert!(start.elapsed() < Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        ToolExecutor::new(tools()).with_concurrency(1).execute_batch(&calls).await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let exec = ToolExecutor::new(registry(vec![])).with_concurrency(0);
        assert_eq!(exec.concurrency, 1);
    }

    #[test]
    fn builtin_schemas_accept_their_examples() {
        let tools = parley_tools::default_registry();
        let calc = tools.get("calculator").unwrap();
        assert!(validate_arguments(&calc.parameters_schema(), &json!({"expression": "1+2"})).is_ok());
        assert!(validate_arguments(&calc.parameters_schema(), &json!({"expr": "1+2"})).is_err());
    }
}
