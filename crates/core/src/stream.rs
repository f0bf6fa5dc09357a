//! Wire events of one streamed turn.
//!
//! Every turn is an ordered sequence of [`StreamEvent`]s ending in exactly
//! one terminal event (`Done` or `Error`).

use serde::{Deserialize, Serialize};

use crate::document::FileEntry;
use crate::message::Message;
use crate::tool::ToolOutput;

/// Body of `POST /v1/chat/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub thread_id: String,
    pub org_id: String,
    pub user_id: String,
    /// Persisted thread history, oldest first, excluding the new message.
    #[serde(default)]
    pub history: Vec<Message>,
    pub new_message_text: String,
    /// Id the client already persisted the new message under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub file_manifest: Vec<FileEntry>,
}

/// One typed unit of the streaming protocol.
///
/// Serialized as a flat JSON object tagged by `type`:
/// `{"type":"tool_end","callId":"c1","name":"lookup","output":"42","isError":false}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A model text delta.
    Token { text: String },

    /// A tool call is about to run.
    ToolStart {
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// A tool call finished (successfully or not).
    ToolEnd {
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        output: ToolOutput,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },

    /// The turn failed. Terminal.
    Error { message: String },

    /// The turn completed. Terminal.
    Done,
}

impl StreamEvent {
    /// The wire tag, also used as the SSE `event:` name.
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::ToolStart { .. } => "tool_start",
            StreamEvent::ToolEnd { .. } => "tool_end",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }

    /// All tags a peer may legitimately send.
    pub const KNOWN_TYPES: [&'static str; 5] = ["token", "tool_start", "tool_end", "error", "done"];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_wire_shape() {
        let body = r#"{"threadId":"t1","orgId":"acme","userId":"u1","newMessageText":"hello"}"#;
        let req: ChatRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.new_message_text, "hello");
        assert!(req.history.is_empty());
        assert!(req.file_manifest.is_empty());
        assert!(req.message_id.is_none());

        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("fileManifest").is_some());
        assert!(json.get("messageId").is_none());
    }

    #[test]
    fn token_wire_shape() {
        let json = serde_json::to_value(StreamEvent::Token { text: "Hi".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "token", "text": "Hi"}));
    }

    #[test]
    fn tool_events_use_camel_case_fields() {
        let start = StreamEvent::ToolStart {
            call_id: "c1".into(),
            name: "lookup".into(),
            arguments: serde_json::json!({"q": "x"}),
        };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["type"], "tool_start");
        assert_eq!(json["callId"], "c1");
        assert_eq!(json["arguments"]["q"], "x");

        let end: StreamEvent = serde_json::from_str(
            r#"{"type":"tool_end","callId":"c1","name":"lookup","output":{"result":"42"},"isError":false}"#,
        )
        .unwrap();
        match end {
            StreamEvent::ToolEnd { call_id, output, is_error, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(output.as_text(), r#"{"result":"42"}"#);
                assert!(!is_error);
            }
            other => panic!("expected ToolEnd, got {other:?}"),
        }
    }

    #[test]
    fn done_is_a_bare_tag() {
        let json = serde_json::to_string(&StreamEvent::Done).unwrap();
        assert_eq!(json, r#"{"type":"done"}"#);
        let back: StreamEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(back.is_terminal());
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let events = [
            StreamEvent::Token { text: String::new() },
            StreamEvent::Error { message: "x".into() },
            StreamEvent::Done,
        ];
        for ev in events {
            let json = serde_json::to_value(&ev).unwrap();
            assert_eq!(json["type"], ev.event_type());
            assert!(StreamEvent::KNOWN_TYPES.contains(&ev.event_type()));
        }
    }
}
