//! Client side of the Parley streaming protocol.
//!
//! - [`StreamParser`] turns an SSE byte stream, chunked arbitrarily, into
//!   typed [`StreamEvent`](parley_core::StreamEvent)s.
//! - [`ConversationSession`] is the synchronous transcript state machine:
//!   optimistic user messages, the streaming buffer, tool blocks.
//! - [`TurnDriver`] performs the IO of one turn: it persists the user
//!   message while opening the stream, feeds the session, and persists the
//!   final assistant message.
//! - [`HttpTransport`] and [`HttpStore`] talk to a Parley gateway.

pub mod driver;
pub mod error;
pub mod http;
pub mod parser;
pub mod state;

pub use driver::{ByteStream, ChatTransport, TurnDriver, TurnReport, TurnStatus};
pub use error::ClientError;
pub use http::{HttpStore, HttpTransport, ORG_HEADER};
pub use parser::{FrameError, ParseBatch, StreamParser};
pub use state::{Applied, ConversationSession, StateError, ToolBlock, ToolBlockStatus, TurnPhase};
