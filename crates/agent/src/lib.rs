//! The conversation engine — the heart of Parley.
//!
//! One turn flows through four parts:
//!
//! 1. **Assemble** the prompt: instructions, profile, file manifest, trimmed history
//! 2. **Run** the execution graph: invoke the model, execute requested tools, loop
//! 3. **Encode** graph steps into ordered wire events
//! 4. **Stream** the events to the caller, ending in exactly one `done` or `error`
//!
//! The loop continues until the model answers without tool calls, or a
//! fatal condition (model failure, iteration cap, timeout, cancellation)
//! ends the turn.

pub mod context;
pub mod encoder;
pub mod engine;
pub mod executor;
pub mod graph;

#[cfg(any(test, feature = "testing"))]
pub mod test_helpers;

pub use context::{
    AssembledPrompt, AssemblyInput, AssemblyMetadata, ContextAssembler, DropInfo, LayerStats, TrimPolicy,
};
pub use encoder::{EventEncoder, to_sse_frame};
pub use engine::{ConversationEngine, TurnRequest};
pub use executor::{ToolExecutor, ToolRun};
pub use graph::{ExecutionContext, ExecutionGraph, GraphState, GraphStep, TurnError, TurnOutcome};
