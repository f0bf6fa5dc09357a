//! # Parley Core
//!
//! Domain types, collaborator traits, and error definitions for the Parley
//! conversation engine. Every other crate depends inward on this one.
//!
//! Collaborators (model providers, tools, stores, document extraction,
//! profiles) are traits here; implementations live in their own crates.

pub mod document;
pub mod error;
pub mod event;
pub mod message;
pub mod profile;
pub mod provider;
pub mod store;
pub mod stream;
pub mod tool;

pub use document::{DocumentExtractor, Extraction, ExtractionMetadata, FileEntry, PlainTextExtractor};
pub use error::{Error, ProviderError, Result, StoreError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, Role};
pub use profile::{Profile, ProfileEntry, ProfileField, ProfileSource, StaticProfiles};
pub use provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage};
pub use store::ConversationStore;
pub use stream::{ChatRequest, StreamEvent};
pub use tool::{Tool, ToolCall, ToolOutput, ToolRegistry, ToolResult};
