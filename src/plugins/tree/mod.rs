//! Branching conversation trees.
//!
//! A conversation is a tree of typed turns rooted at one system node:
//!
//! ```text
//! system ─┬─ user ── llm ─┬─ user ── llm
//!         │               └─ user
//!         └─ user ── llm
//! ```
//!
//! `system` and `llm` nodes take any number of `user` children; a `user` node
//! takes at most one `llm` child.

mod error;
pub mod index;
mod node;
mod record;
mod session;
#[allow(clippy::module_inception)]
mod tree;

pub use error::TreeError;
pub use index::{
    CONVERSATION_KEY_PREFIX, ConversationSummary, conversation_key, delete_conversation,
    format_relative_time, list_conversations,
};
pub use node::{Node, NodeType};
pub use record::RECORD_VERSION;
pub use session::ConversationSession;
pub use tree::{Applied, ConversationTree, Effect, Effects, GenerationOutcome};
