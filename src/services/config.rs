//! Shared configuration loading for the completion client.
//!
//! `AiPublicConfig` is safe to print or hand to a UI; `AiConfig` carries the key.

use serde::{Deserialize, Serialize};

use crate::services::ai::{ModelProfile, TokenLimitField, default_model_profiles};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    OpenAI,
    DeepSeek,
    Compatible,
}

/// AI configuration for OpenAI-compatible endpoints.
#[derive(Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub provider: AiProvider,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-family request shaping, matched by longest model-name prefix.
    pub model_profiles: Vec<ModelProfile>,
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let api_key = if self.api_key.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("AiConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &api_key)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("model_profiles", &self.model_profiles)
            .finish()
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: AiProvider::OpenAI,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            model_profiles: default_model_profiles(),
        }
    }
}

impl AiConfig {
    /// False when the key is missing or still the sample value from a template `.env`.
    pub fn has_usable_api_key(&self) -> bool {
        !is_placeholder_api_key(&self.api_key)
    }

    pub fn public(&self) -> AiPublicConfig {
        AiPublicConfig {
            provider: self.provider,
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            has_api_key: self.has_usable_api_key(),
        }
    }
}

pub(crate) fn is_placeholder_api_key(key: &str) -> bool {
    let key = key.trim();
    if key.is_empty() {
        return true;
    }
    let lower = key.to_ascii_lowercase();
    if matches!(
        lower.as_str(),
        "your-api-key" | "your_api_key" | "changeme" | "sk-..." | "sk-xxx"
    ) {
        return true;
    }
    let trailing_x = lower.chars().rev().take_while(|c| *c == 'x').count();
    lower.starts_with("sk-") && trailing_x >= 8
}

fn infer_provider(base_url: &str) -> AiProvider {
    let base = base_url.trim().to_ascii_lowercase();
    if base.contains("api.deepseek.com") {
        return AiProvider::DeepSeek;
    }
    if base.contains("api.openai.com") {
        return AiProvider::OpenAI;
    }
    AiProvider::Compatible
}

fn normalize_api_base(provider: AiProvider, base_url: &str) -> String {
    let mut base = base_url.trim().trim_end_matches('/').to_string();

    match provider {
        AiProvider::OpenAI => {
            if !base.ends_with("/v1") {
                base.push_str("/v1");
            }
        }
        AiProvider::DeepSeek => {
            if base.ends_with("/v1") {
                base.truncate(base.len().saturating_sub(3));
            }
        }
        AiProvider::Compatible => {}
    }

    base
}

/// Parse `prefix:field[:notemp]` entries separated by commas.
///
/// `field` is `max_tokens` or `max_completion_tokens`. Malformed entries are skipped.
fn parse_model_profiles(raw: &str) -> Vec<ModelProfile> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.split(':').map(str::trim);
        let prefix = parts.next().unwrap_or_default();
        let field = match parts.next() {
            Some("max_tokens") => TokenLimitField::MaxTokens,
            Some("max_completion_tokens") => TokenLimitField::MaxCompletionTokens,
            _ => {
                log::warn!("Ignoring malformed model profile entry: {entry}");
                continue;
            }
        };
        let sends_temperature = !matches!(parts.next(), Some("notemp"));
        if prefix.is_empty() {
            log::warn!("Ignoring model profile with empty prefix: {entry}");
            continue;
        }
        out.push(ModelProfile {
            prefix: prefix.to_string(),
            sends_temperature,
            token_limit_field: field,
        });
    }
    out
}

fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Load AI configuration from `.env`/environment.
///
/// Reads:
/// - `AI_BASE_URL` (fallback: `LLM_BASE_URL`)
/// - `AI_PROVIDER` (fallback: `LLM_PROVIDER`)
/// - `AI_API_KEY` (fallback: `OPENAI_API_KEY`, `LLM_API_KEY`)
/// - `AI_MODEL` (fallback: `LLM_MODEL`)
/// - `AI_TEMPERATURE`, `AI_MAX_TOKENS`
/// - `AI_MODEL_PROFILES` (extra entries, take precedence over the built-in table)
pub fn load_ai_config() -> AiConfig {
    let _ = dotenvy::dotenv();

    let base_url = env_first(&["AI_BASE_URL", "LLM_BASE_URL"])
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

    let provider = match env_first(&["AI_PROVIDER", "LLM_PROVIDER"])
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "openai" => AiProvider::OpenAI,
        "deepseek" => AiProvider::DeepSeek,
        "compatible" | "openai-compatible" | "openai_compatible" => AiProvider::Compatible,
        _ => infer_provider(&base_url),
    };

    let temperature = env_first(&["AI_TEMPERATURE", "LLM_TEMPERATURE"])
        .and_then(|v| v.parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(DEFAULT_TEMPERATURE);

    let max_tokens = env_first(&["AI_MAX_TOKENS", "LLM_MAX_TOKENS"])
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut model_profiles = env_first(&["AI_MODEL_PROFILES"])
        .map(|raw| parse_model_profiles(&raw))
        .unwrap_or_default();
    model_profiles.extend(default_model_profiles());

    AiConfig {
        provider,
        base_url: normalize_api_base(provider, &base_url),
        api_key: env_first(&["AI_API_KEY", "OPENAI_API_KEY", "LLM_API_KEY"]).unwrap_or_default(),
        model: env_first(&["AI_MODEL", "LLM_MODEL"]).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        temperature,
        max_tokens,
        model_profiles,
    }
}

/// Public AI configuration (secrets omitted).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPublicConfig {
    pub provider: AiProvider,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub has_api_key: bool,
}
