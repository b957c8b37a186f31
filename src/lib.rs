//! Branching LLM conversation trees with autosave.
//!
//! [`plugins::tree`] holds the conversation model and its session driver,
//! [`plugins::kv`] the storage substrate and [`services::ai`] the completion
//! client.

pub mod plugins;
pub mod services;

pub use plugins::kv::{KvStore, LibsqlKvStore, MemoryKvStore, StoreError};
pub use plugins::tree::{
    ConversationSession, ConversationSummary, ConversationTree, Node, NodeType, TreeError,
};
pub use services::ai::{AiError, ChatMessage, ChatRole, CompletionBackend, OpenAiCompletionClient};
pub use services::ids::{ConversationId, ensure_conversation_id};
