//! Event encoder — graph steps to wire events.
//!
//! The encoder is the last line of defence for stream ordering: it never
//! emits a `tool_end` without an open `tool_start`, closes any call left
//! open before the terminal event, and emits nothing after it.

use crate::graph::GraphStep;
use parley_core::stream::StreamEvent;
use parley_core::tool::ToolOutput;
use tracing::warn;

/// Output recorded for a call still open when the turn ends.
pub const INCOMPLETE_CALL_OUTPUT: &str = "Tool call did not complete before the turn ended";

/// Per-turn encoder state.
#[derive(Debug, Default)]
pub struct EventEncoder {
    /// Calls with a `tool_start` but no `tool_end` yet, in start order.
    open: Vec<(String, String)>,
    finished: bool,
}

impl EventEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the terminal event has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Encode one step into zero or more wire events.
    pub fn encode(&mut self, step: GraphStep) -> Vec<StreamEvent> {
        if self.finished {
            warn!(?step, "Dropping graph step after terminal event");
            return Vec::new();
        }

        match step {
            GraphStep::TokenDelta(text) if text.is_empty() => Vec::new(),
            GraphStep::TokenDelta(text) => vec![StreamEvent::Token { text }],
            GraphStep::ToolsRequested(calls) => {
                let mut events = Vec::with_capacity(calls.len());
                for call in calls {
                    if self.open.iter().any(|(id, _)| *id == call.id) {
                        warn!(call_id = %call.id, "Dropping duplicate tool_start");
                        continue;
                    }
                    self.open.push((call.id.clone(), call.name.clone()));
                    events.push(StreamEvent::ToolStart {
                        call_id: call.id,
                        name: call.name,
                        arguments: call.arguments,
                    });
                }
                events
            }
            GraphStep::ToolFinished(result) => {
                match self.open.iter().position(|(id, _)| *id == result.call_id) {
                    Some(index) => {
                        self.open.remove(index);
                        vec![StreamEvent::ToolEnd {
                            call_id: result.call_id,
                            name: result.name,
                            output: result.output,
                            is_error: result.is_error,
                        }]
                    }
                    None => {
                        warn!(call_id = %result.call_id, "Dropping tool_end without a matching tool_start");
                        Vec::new()
                    }
                }
            }
            GraphStep::Completed { .. } => self.terminate(StreamEvent::Done),
            GraphStep::Failed { message } => self.terminate(StreamEvent::Error { message }),
        }
    }

    fn terminate(&mut self, terminal: StreamEvent) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = self
            .open
            .drain(..)
            .map(|(call_id, name)| {
                warn!(%call_id, "Closing tool call left open at end of turn");
                StreamEvent::ToolEnd {
                    call_id,
                    name,
                    output: ToolOutput::Text(INCOMPLETE_CALL_OUTPUT.into()),
                    is_error: true,
                }
            })
            .collect();
        events.push(terminal);
        self.finished = true;
        events
    }
}

/// Frame one event as a Server-Sent-Events message.
pub fn to_sse_frame(event: &StreamEvent) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(event)?;
    Ok(format!("event: {}\ndata: {data}\n\n", event.event_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_tool_call;
    use parley_core::tool::ToolResult;
    use serde_json::json;

    fn lookup() -> parley_core::tool::ToolCall {
        make_tool_call("c1", "lookup", json!({"q": "x"}))
    }

    #[test]
    fn tokens_map_one_to_one_and_empty_is_skipped() {
        let mut enc = EventEncoder::new();
        assert_eq!(
            enc.encode(GraphStep::TokenDelta("Hi".into())),
            vec![StreamEvent::Token { text: "Hi".into() }]
        );
        assert!(enc.encode(GraphStep::TokenDelta(String::new())).is_empty());
    }

    #[test]
    fn tool_lifecycle_is_paired() {
        let mut enc = EventEncoder::new();
        let starts = enc.encode(GraphStep::ToolsRequested(vec![lookup()]));
        assert!(matches!(&starts[..], [StreamEvent::ToolStart { call_id, .. }] if call_id == "c1"));

        let ends = enc.encode(GraphStep::ToolFinished(ToolResult::success(&lookup(), "42")));
        assert!(matches!(&ends[..], [StreamEvent::ToolEnd { call_id, is_error: false, .. }] if call_id == "c1"));

        let done = enc.encode(GraphStep::Completed { content: String::new() });
        assert_eq!(done, vec![StreamEvent::Done]);
    }

    #[test]
    fn orphan_tool_end_is_dropped() {
        let mut enc = EventEncoder::new();
        assert!(enc.encode(GraphStep::ToolFinished(ToolResult::success(&lookup(), "42"))).is_empty());
    }

    #[test]
    fn duplicate_tool_start_is_dropped() {
        let mut enc = EventEncoder::new();
        let events = enc.encode(GraphStep::ToolsRequested(vec![lookup(), lookup()]));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn open_calls_are_closed_before_error() {
        let mut enc = EventEncoder::new();
        enc.encode(GraphStep::ToolsRequested(vec![lookup()]));
        let events = enc.encode(GraphStep::Failed {
            message: "Turn cancelled".into(),
        });
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::ToolEnd { is_error: true, .. }));
        assert_eq!(
            events[1],
            StreamEvent::Error {
                message: "Turn cancelled".into()
            }
        );
    }

    #[test]
    fn nothing_after_terminal() {
        let mut enc = EventEncoder::new();
        enc.encode(GraphStep::Completed { content: "x".into() });
        assert!(enc.is_finished());
        assert!(enc.encode(GraphStep::TokenDelta("late".into())).is_empty());
        assert!(enc.encode(GraphStep::Failed { message: "late".into() }).is_empty());
    }

    #[test]
    fn sse_frame_layout() {
        let frame = to_sse_frame(&StreamEvent::Token { text: "Hi".into() }).unwrap();
        assert_eq!(frame, "event: token\ndata: {\"type\":\"token\",\"text\":\"Hi\"}\n\n");
        assert_eq!(to_sse_frame(&StreamEvent::Done).unwrap(), "event: done\ndata: {\"type\":\"done\"}\n\n");
    }
}
