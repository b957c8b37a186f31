//! Per-model-family request shaping.
//!
//! Some model families reject a custom `temperature` and expect the output cap
//! under `max_completion_tokens`. Families are matched by model-name prefix; the
//! longest matching prefix wins, ties go to the earlier entry.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLimitField {
    MaxTokens,
    MaxCompletionTokens,
}

impl TokenLimitField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::MaxCompletionTokens => "max_completion_tokens",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub prefix: String,
    pub sends_temperature: bool,
    pub token_limit_field: TokenLimitField,
}

impl ModelProfile {
    fn reasoning_family(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            sends_temperature: false,
            token_limit_field: TokenLimitField::MaxCompletionTokens,
        }
    }
}

/// Used when no entry matches.
pub const STANDARD_PROFILE: ResolvedProfile = ResolvedProfile {
    sends_temperature: true,
    token_limit_field: TokenLimitField::MaxTokens,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedProfile {
    pub sends_temperature: bool,
    pub token_limit_field: TokenLimitField,
}

pub fn default_model_profiles() -> Vec<ModelProfile> {
    ["gpt-5", "o1", "o3", "o4"]
        .into_iter()
        .map(ModelProfile::reasoning_family)
        .collect()
}

pub fn resolve_profile(profiles: &[ModelProfile], model: &str) -> ResolvedProfile {
    let model = model.trim().to_ascii_lowercase();
    let mut best: Option<&ModelProfile> = None;
    for profile in profiles {
        if !model.starts_with(&profile.prefix.to_ascii_lowercase()) {
            continue;
        }
        if best.is_none_or(|b| profile.prefix.len() > b.prefix.len()) {
            best = Some(profile);
        }
    }

    best.map(|p| ResolvedProfile {
        sends_temperature: p.sends_temperature,
        token_limit_field: p.token_limit_field,
    })
    .unwrap_or(STANDARD_PROFILE)
}
