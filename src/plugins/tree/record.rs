//! Persisted conversation record (JSON, one per handle).
//!
//! ```text
//! { version: 1, nodes: [...], nodesById: {...}, seq, title, titleGenerated,
//!   createdAt, updatedAt }
//! ```
//!
//! `nodes` is authoritative on load; `nodesById` is written for readers that
//! want keyed access and is rebuilt from `nodes` when reading.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::services::ids::ConversationId;

use super::TreeError;
use super::node::{Node, node_seq};
use super::tree::ConversationTree;

pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordOut<'a> {
    version: u32,
    nodes: Vec<&'a Node>,
    nodes_by_id: BTreeMap<&'a str, &'a Node>,
    seq: u64,
    title: &'a str,
    title_generated: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Lenient read shape; older writers omitted fields or used `timestamp`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordIn {
    version: Option<u32>,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    nodes_by_id: Option<BTreeMap<String, JsonValue>>,
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    title_generated: bool,
    #[serde(default)]
    created_at: Option<JsonValue>,
    #[serde(default)]
    updated_at: Option<JsonValue>,
    #[serde(default)]
    timestamp: Option<JsonValue>,
}

/// Accept RFC 3339 strings and epoch milliseconds.
pub(crate) fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// `createdAt`/`updatedAt`, else the legacy `timestamp`, else `now`.
pub(crate) fn resolve_timestamps(
    created_at: Option<&JsonValue>,
    updated_at: Option<&JsonValue>,
    legacy: Option<&JsonValue>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let legacy = legacy.and_then(parse_timestamp);
    let created = created_at.and_then(parse_timestamp).or(legacy).unwrap_or(now);
    let updated = updated_at.and_then(parse_timestamp).or(legacy).unwrap_or(now);
    (created, updated)
}

/// A record that fails to encode is a bug on our side, not a corrupt store.
fn encode_failed(err: serde_json::Error) -> TreeError {
    TreeError::internal(format!("Failed to serialize conversation: {err}"))
}

impl ConversationTree {
    pub fn serialize_state(&self) -> Result<String, TreeError> {
        let nodes: Vec<&Node> = self.nodes().collect();
        let nodes_by_id = nodes.iter().map(|n| (n.id.as_str(), *n)).collect();
        let record = RecordOut {
            version: RECORD_VERSION,
            nodes,
            nodes_by_id,
            seq: self.seq(),
            title: self.title(),
            title_generated: self.title_generated(),
            created_at: self.created_at(),
            updated_at: self.updated_at(),
        };
        serde_json::to_string(&record).map_err(encode_failed)
    }

    pub fn deserialize_state(
        handle: Option<ConversationId>,
        raw: &str,
    ) -> Result<ConversationTree, TreeError> {
        Self::deserialize_state_at(handle, raw, Utc::now())
    }

    pub fn deserialize_state_at(
        handle: Option<ConversationId>,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationTree, TreeError> {
        let record: RecordIn = serde_json::from_str(raw)?;

        let version = record.version.unwrap_or(RECORD_VERSION);
        if version > RECORD_VERSION {
            return Err(TreeError::unsupported_version(format!(
                "Conversation record version {version} is newer than supported version {RECORD_VERSION}"
            )));
        }

        if let Some(index) = record.nodes_by_id.as_ref() {
            let in_sync = index.len() == record.nodes.len()
                && record.nodes.iter().all(|n| index.contains_key(&n.id));
            if !in_sync {
                log::warn!("nodesById out of sync with nodes; rebuilding from nodes");
            }
        }

        let max_seq = record.nodes.iter().filter_map(|n| node_seq(&n.id)).max();
        let mut seq = record.seq;
        if let Some(max_seq) = max_seq {
            if seq <= max_seq {
                log::warn!(
                    "Stored seq {} would reuse existing ids; raising to {}",
                    seq,
                    max_seq + 1
                );
                seq = max_seq + 1;
            }
        }

        let (created_at, updated_at) = resolve_timestamps(
            record.created_at.as_ref(),
            record.updated_at.as_ref(),
            record.timestamp.as_ref(),
            now,
        );

        let tree = ConversationTree::from_parts(
            handle,
            record.nodes,
            seq,
            record.title.unwrap_or_default(),
            record.title_generated,
            created_at,
            updated_at,
        );
        tree.validate()?;
        Ok(tree)
    }
}
