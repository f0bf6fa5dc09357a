//! Conversation store implementations for Parley.
//!
//! Both stores treat `append` as idempotent on the message id, so a client
//! retrying a save after an ambiguous failure never duplicates a message.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
