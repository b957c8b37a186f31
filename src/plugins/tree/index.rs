//! Listing of saved conversations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::plugins::kv::{KvStore, StoreError};
use crate::services::ids::ConversationId;
use crate::services::prompts;

use super::record::resolve_timestamps;

pub const CONVERSATION_KEY_PREFIX: &str = "conversation_";

pub fn conversation_key(id: &ConversationId) -> String {
    format!("{CONVERSATION_KEY_PREFIX}{}", id.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub node_count: usize,
}

/// Just enough of a record to summarize it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryRecord {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    nodes: Option<JsonValue>,
    #[serde(default)]
    created_at: Option<JsonValue>,
    #[serde(default)]
    updated_at: Option<JsonValue>,
    #[serde(default)]
    timestamp: Option<JsonValue>,
}

fn summarize(
    id: ConversationId,
    raw: &str,
    now: DateTime<Utc>,
) -> Result<ConversationSummary, serde_json::Error> {
    let record: SummaryRecord = serde_json::from_str(raw)?;
    let (created_at, updated_at) = resolve_timestamps(
        record.created_at.as_ref(),
        record.updated_at.as_ref(),
        record.timestamp.as_ref(),
        now,
    );
    let title = record
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| prompts::UNTITLED.to_string());

    Ok(ConversationSummary {
        id,
        title,
        created_at,
        updated_at,
        node_count: record
            .nodes
            .as_ref()
            .and_then(JsonValue::as_array)
            .map_or(0, Vec::len),
    })
}

/// Summaries of every stored conversation, most recently updated first.
///
/// Entries that cannot be read or parsed are skipped with a warning.
pub async fn list_conversations(
    store: &dyn KvStore,
) -> Result<Vec<ConversationSummary>, StoreError> {
    let now = Utc::now();
    let mut out = Vec::new();

    for key in store.keys().await? {
        let Some(raw_id) = key.strip_prefix(CONVERSATION_KEY_PREFIX) else {
            continue;
        };
        let Some(id) = ConversationId::parse(raw_id) else {
            log::warn!("Skipping conversation entry with invalid id: {}", key);
            continue;
        };

        let raw = match store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(err) => {
                log::warn!("Failed to read {}: {}", key, err);
                continue;
            }
        };

        match summarize(id, &raw, now) {
            Ok(summary) => out.push(summary),
            Err(err) => log::warn!("Skipping unreadable conversation {}: {}", key, err),
        }
    }

    out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(out)
}

/// Returns whether a record was removed.
pub async fn delete_conversation(
    store: &dyn KvStore,
    id: &ConversationId,
) -> Result<bool, StoreError> {
    let removed = store.remove(&conversation_key(id)).await?;
    if removed {
        log::info!("Deleted conversation {}", id);
    }
    Ok(removed)
}

/// Coarse "how long ago" label for list views.
pub fn format_relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    fn plural(n: i64, unit: &str) -> String {
        if n == 1 {
            format!("1 {unit} ago")
        } else {
            format!("{n} {unit}s ago")
        }
    }

    if seconds < 60 {
        "just now".to_string()
    } else if minutes < 60 {
        plural(minutes, "minute")
    } else if hours < 24 {
        plural(hours, "hour")
    } else if days < 30 {
        plural(days, "day")
    } else {
        then.format("%Y-%m-%d").to_string()
    }
}
