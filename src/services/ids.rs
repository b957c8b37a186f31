//! Conversation handles.
//!
//! A handle names one persisted conversation. Fresh handles are uuid v4; handles
//! coming from outside (CLI args, links) are accepted when they are non-empty and
//! only use characters that are safe inside a storage key.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_HANDLE_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > MAX_HANDLE_LEN {
            return None;
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Return the caller's handle if it is usable, otherwise mint a new one.
pub fn ensure_conversation_id(current: Option<&str>) -> ConversationId {
    match current.and_then(ConversationId::parse) {
        Some(id) => id,
        None => {
            let id = ConversationId::new();
            log::debug!("Assigned new conversation handle {}", id);
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique_uuids() {
        let a = ConversationId::new();
        let b = ConversationId::new();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_parse_rejects_unsafe_handles() {
        assert!(ConversationId::parse("").is_none());
        assert!(ConversationId::parse("a/b").is_none());
        assert!(ConversationId::parse("has space").is_none());
        assert!(ConversationId::parse(&"x".repeat(MAX_HANDLE_LEN + 1)).is_none());
        assert_eq!(
            ConversationId::parse(" chat_01-a ").map(|id| id.to_string()),
            Some("chat_01-a".to_string())
        );
    }

    #[test]
    fn test_ensure_keeps_valid_and_replaces_missing() {
        assert_eq!(ensure_conversation_id(Some("keep-me")).as_str(), "keep-me");
        let minted = ensure_conversation_id(None);
        assert!(Uuid::parse_str(minted.as_str()).is_ok());
        let replaced = ensure_conversation_id(Some("bad id"));
        assert_ne!(replaced.as_str(), "bad id");
    }
}
