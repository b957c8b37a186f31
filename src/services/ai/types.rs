use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One role-tagged entry of the model input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AiError {
    /// Missing or placeholder credential; raised before any network attempt.
    Config { message: String },
    /// The provider answered with an error.
    Provider {
        status: Option<u16>,
        message: String,
    },
    /// Success status but no candidate output.
    EmptyResponse { message: String },
    /// Connection, timeout or decoding failure.
    Transport { message: String },
}

impl AiError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    pub fn empty_response(message: impl Into<String>) -> Self {
        Self::EmptyResponse {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Config { message }
            | Self::Provider { message, .. }
            | Self::EmptyResponse { message }
            | Self::Transport { message } => message,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => *status,
            _ => None,
        }
    }
}

impl std::fmt::Display for AiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config { message } => write!(f, "Config: {}", message),
            Self::Provider {
                status: Some(status),
                message,
            } => write!(f, "Provider (HTTP {}): {}", status, message),
            Self::Provider {
                status: None,
                message,
            } => write!(f, "Provider: {}", message),
            Self::EmptyResponse { message } => write!(f, "EmptyResponse: {}", message),
            Self::Transport { message } => write!(f, "Transport: {}", message),
        }
    }
}

impl std::error::Error for AiError {}
