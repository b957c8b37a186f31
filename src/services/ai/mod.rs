//! Completion client for OpenAI-compatible chat APIs.
//!
//! Notes:
//! - We use `async-openai` for its HTTP client and its `byot` ("bring your own
//!   types") methods, so the request body can be shaped per model family
//!   (see [`profile`]) instead of going through the typed request builders.
//! - Only non-streaming calls are made; the tree store writes a whole answer at once.

mod client;
mod profile;
mod request;
mod retry_policy;
mod types;

pub use client::{CompletionBackend, OpenAiCompletionClient};
pub use profile::{
    ModelProfile, ResolvedProfile, STANDARD_PROFILE, TokenLimitField, default_model_profiles,
    resolve_profile,
};
pub use types::{AiError, ChatMessage, ChatRole};
