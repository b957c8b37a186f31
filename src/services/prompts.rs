//! Centralized prompt and placeholder text.
//!
//! Single source of truth for every string the tree store seeds into nodes or
//! sends to the model on its own behalf.

// ============================================================================
// NODE PLACEHOLDERS
// ============================================================================

/// Text of a freshly initialized root node
pub const SYSTEM_NODE_DEFAULT: &str = "System instructions:";

/// Sent instead of an empty root text when building model context
pub const SYSTEM_PROMPT_FALLBACK: &str = "You are a helpful assistant.";

/// Text of a new user node
pub const USER_NODE_PLACEHOLDER: &str = "New prompt...";

/// Text of a new llm node before generation
pub const LLM_NODE_PLACEHOLDER: &str = "LLM response...";

/// Title of a conversation that has not been named yet
pub const UNTITLED: &str = "Untitled";

// ============================================================================
// TITLE GENERATION
// ============================================================================

pub const TITLE_SYSTEM_PROMPT: &str =
    "You name conversations. Reply with a short title only, without quotes or trailing punctuation.";

/// Max characters kept from a generated title
pub const TITLE_MAX_CHARS: usize = 60;

/// Output cap for the title request
pub const TITLE_MAX_TOKENS: u32 = 64;

pub fn title_request(transcript: &str) -> String {
    format!(
        "Generate a concise title (at most 6 words) for the following conversation:\n\n{}",
        transcript
    )
}

// ============================================================================
// ERROR MARKERS
// ============================================================================

const ERROR_MARKER_PREFIX: &str = "[Error]";

/// Text written into an llm node whose generation failed
pub fn generation_error_marker(message: &str) -> String {
    format!("{} {}", ERROR_MARKER_PREFIX, message.trim())
}

pub fn is_generation_error_marker(text: &str) -> bool {
    text.starts_with(ERROR_MARKER_PREFIX)
}
