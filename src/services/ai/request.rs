use serde_json::{Map, Value as JsonValue};

use crate::services::config::AiConfig;

use super::profile::resolve_profile;
use super::types::{AiError, ChatMessage};

/// Build a non-streaming chat-completion body shaped for the configured model.
pub(super) fn build_chat_request(
    config: &AiConfig,
    messages: &[ChatMessage],
    max_tokens: u32,
) -> JsonValue {
    let profile = resolve_profile(&config.model_profiles, &config.model);

    let mut body = Map::new();
    body.insert("model".to_string(), JsonValue::from(config.model.clone()));
    body.insert(
        "messages".to_string(),
        serde_json::to_value(messages).unwrap_or(JsonValue::Array(Vec::new())),
    );
    body.insert("stream".to_string(), JsonValue::Bool(false));
    if profile.sends_temperature {
        body.insert(
            "temperature".to_string(),
            JsonValue::from(config.temperature as f64),
        );
    }
    body.insert(
        profile.token_limit_field.as_str().to_string(),
        JsonValue::from(max_tokens),
    );

    JsonValue::Object(body)
}

/// Text of the first choice.
pub(super) fn parse_completion(response: &JsonValue) -> Result<String, AiError> {
    let first = response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| AiError::empty_response("No response received from the model"))?;

    let content = first
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");

    Ok(content.to_string())
}

/// Strip one pair of surrounding quotes and whitespace from a model-written title.
pub(super) fn clean_title(raw: &str) -> String {
    let trimmed = raw.trim();
    const PAIRS: [(char, char); 4] = [('"', '"'), ('\'', '\''), ('“', '”'), ('«', '»')];
    for (open, close) in PAIRS {
        if let Some(inner) = trimmed
            .strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}
