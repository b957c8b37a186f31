use serde::{Deserialize, Serialize};

use crate::services::ai::ChatRole;
use crate::services::prompts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    System,
    User,
    Llm,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Llm => "llm",
        }
    }

    /// Display label used by node cards.
    pub fn label(&self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User Prompt",
            Self::Llm => "LLM Response",
        }
    }

    pub fn role(&self) -> ChatRole {
        match self {
            Self::System => ChatRole::System,
            Self::User => ChatRole::User,
            Self::Llm => ChatRole::Assistant,
        }
    }

    /// The only child type this node type accepts, with the per-parent cap.
    pub fn child_rule(&self) -> (NodeType, Option<usize>) {
        match self {
            Self::System | Self::Llm => (NodeType::User, None),
            Self::User => (NodeType::Llm, Some(1)),
        }
    }

    pub(crate) fn placeholder(&self) -> &'static str {
        match self {
            Self::System => prompts::SYSTEM_NODE_DEFAULT,
            Self::User => prompts::USER_NODE_PLACEHOLDER,
            Self::Llm => prompts::LLM_NODE_PLACEHOLDER,
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "llm" | "assistant" => Ok(Self::Llm),
            other => Err(format!("Unknown node type: {other}")),
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub text: String,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.node_type == NodeType::System && self.parent_id.is_none()
    }
}

pub(crate) fn node_id(seq: u64) -> String {
    format!("n{seq}")
}

/// Numeric suffix of a `n<k>` id.
pub(crate) fn node_seq(id: &str) -> Option<u64> {
    id.strip_prefix('n')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_rules() {
        assert_eq!(NodeType::System.child_rule(), (NodeType::User, None));
        assert_eq!(NodeType::Llm.child_rule(), (NodeType::User, None));
        assert_eq!(NodeType::User.child_rule(), (NodeType::Llm, Some(1)));
    }

    #[test]
    fn test_node_wire_shape() {
        let node = Node {
            id: "n0".to_string(),
            node_type: NodeType::System,
            parent_id: None,
            children: vec!["n1".to_string()],
            text: "sys".to_string(),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "n0",
                "type": "system",
                "parentId": null,
                "children": ["n1"],
                "text": "sys"
            })
        );
    }

    #[test]
    fn test_ids() {
        assert_eq!(node_id(12), "n12");
        assert_eq!(node_seq("n12"), Some(12));
        assert_eq!(node_seq("x12"), None);
        assert_eq!(node_seq("n"), None);
        assert_eq!("assistant".parse::<NodeType>(), Ok(NodeType::Llm));
        assert!("tool".parse::<NodeType>().is_err());
    }
}
