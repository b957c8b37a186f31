use serde::{Deserialize, Serialize};

use crate::plugins::kv::StoreError;
use crate::services::ai::AiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TreeError {
    NotFound { message: String },
    /// Parent/child pairing breaks the node-typing rules.
    InvalidStructure { message: String },
    ProtectedRoot { message: String },
    WrongNodeType { message: String },
    AlreadyGenerating { message: String },
    Corrupt { message: String },
    UnsupportedVersion { message: String },
    Storage { message: String },
    Completion { error: AiError },
    Internal { message: String },
}

impl TreeError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    pub fn protected_root(message: impl Into<String>) -> Self {
        Self::ProtectedRoot {
            message: message.into(),
        }
    }

    pub fn wrong_node_type(message: impl Into<String>) -> Self {
        Self::WrongNodeType {
            message: message.into(),
        }
    }

    pub fn already_generating(message: impl Into<String>) -> Self {
        Self::AlreadyGenerating {
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    pub fn unsupported_version(message: impl Into<String>) -> Self {
        Self::UnsupportedVersion {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotFound { message }
            | Self::InvalidStructure { message }
            | Self::ProtectedRoot { message }
            | Self::WrongNodeType { message }
            | Self::AlreadyGenerating { message }
            | Self::Corrupt { message }
            | Self::UnsupportedVersion { message }
            | Self::Storage { message }
            | Self::Internal { message } => message,
            Self::Completion { error } => error.message(),
        }
    }

    /// Rejected before any state changed.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::InvalidStructure { .. }
                | Self::ProtectedRoot { .. }
                | Self::WrongNodeType { .. }
                | Self::AlreadyGenerating { .. }
        )
    }
}

impl From<StoreError> for TreeError {
    fn from(err: StoreError) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<AiError> for TreeError {
    fn from(error: AiError) -> Self {
        Self::Completion { error }
    }
}

/// Decoding a stored record. Encode failures go through `TreeError::internal`.
impl From<serde_json::Error> for TreeError {
    fn from(err: serde_json::Error) -> Self {
        Self::corrupt(err.to_string())
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { message } => write!(f, "NotFound: {}", message),
            Self::InvalidStructure { message } => write!(f, "InvalidStructure: {}", message),
            Self::ProtectedRoot { message } => write!(f, "ProtectedRoot: {}", message),
            Self::WrongNodeType { message } => write!(f, "WrongNodeType: {}", message),
            Self::AlreadyGenerating { message } => write!(f, "AlreadyGenerating: {}", message),
            Self::Corrupt { message } => write!(f, "Corrupt: {}", message),
            Self::UnsupportedVersion { message } => write!(f, "UnsupportedVersion: {}", message),
            Self::Storage { message } => write!(f, "Storage: {}", message),
            Self::Completion { error } => write!(f, "Completion: {}", error),
            Self::Internal { message } => write!(f, "Internal: {}", message),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Completion { error } => Some(error),
            _ => None,
        }
    }
}
