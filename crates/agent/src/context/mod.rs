//! Per-turn prompt construction.
//!
//! The assembler turns a thread's history plus profile and file context
//! into one system entry followed by a bounded history window.
//!
//! | Part | Source | Trim strategy |
//! |------|--------|---------------|
//! | Instructions | Configured system prompt | Never trimmed |
//! | Profile fields | Profile source | Truncated, least important field first |
//! | File manifest | Request | Oldest uploads dropped, placeholder added |
//! | History | Request | `TrimPolicy`: newest messages kept |
//! | User message | Request | Never trimmed |

pub mod assembler;
pub mod token;

pub use assembler::{
    AssembledPrompt, AssemblyInput, AssemblyMetadata, ContextAssembler, DropInfo, LayerStats,
    TrimPolicy, TRUNCATION_SUFFIX,
};
