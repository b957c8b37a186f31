use async_openai::error::OpenAIError;

use super::types::AiError;

pub(super) fn should_retry_openai_error(err: &OpenAIError) -> bool {
    match err {
        OpenAIError::Reqwest(e) => e.is_timeout() || e.is_connect(),
        OpenAIError::ApiError(api) => {
            let msg = api.message.to_ascii_lowercase();
            let code = api.code.as_deref().unwrap_or("").to_ascii_lowercase();
            let ty = api.r#type.as_deref().unwrap_or("").to_ascii_lowercase();

            // Quota exhaustion looks like a rate limit but never clears on retry.
            if code.contains("insufficient_quota") || ty.contains("insufficient_quota") {
                return false;
            }

            msg.contains("rate limit")
                || msg.contains("too many")
                || msg.contains("overload")
                || msg.contains("temporarily")
                || code.contains("rate")
                || code.contains("timeout")
                || code.contains("overload")
                || ty.contains("rate")
                || ty.contains("timeout")
        }
        _ => false,
    }
}

pub(super) fn map_openai_error(err: OpenAIError) -> AiError {
    match err {
        OpenAIError::ApiError(api) => {
            let code = api.code.as_deref().unwrap_or("").to_ascii_lowercase();
            let ty = api.r#type.as_deref().unwrap_or("").to_ascii_lowercase();
            let status = if code.contains("rate_limit") || ty.contains("rate_limit") {
                Some(429)
            } else {
                None
            };
            AiError::provider(status, api.message)
        }
        OpenAIError::Reqwest(e) => match e.status() {
            Some(status) => AiError::provider(Some(status.as_u16()), e.to_string()),
            None => AiError::transport(e.to_string()),
        },
        other => AiError::transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::error::ApiError;

    fn api_error(message: &str, code: Option<&str>, ty: Option<&str>) -> OpenAIError {
        OpenAIError::ApiError(ApiError {
            message: message.to_string(),
            r#type: ty.map(str::to_string),
            param: None,
            code: code.map(str::to_string),
        })
    }

    #[test]
    fn test_rate_limit_maps_to_429_and_retries() {
        let err = api_error(
            "Rate limit reached for gpt-4o-mini",
            Some("rate_limit_exceeded"),
            Some("requests"),
        );
        assert!(should_retry_openai_error(&err));

        let mapped = map_openai_error(err);
        assert_eq!(mapped.status(), Some(429));
        assert_eq!(mapped.message(), "Rate limit reached for gpt-4o-mini");
    }

    #[test]
    fn test_insufficient_quota_is_not_retried() {
        let err = api_error(
            "You exceeded your current quota",
            Some("insufficient_quota"),
            Some("insufficient_quota"),
        );
        assert!(!should_retry_openai_error(&err));
        assert!(matches!(
            map_openai_error(err),
            AiError::Provider { status: None, .. }
        ));
    }

    #[test]
    fn test_auth_errors_keep_message_without_retry() {
        let err = api_error(
            "Incorrect API key provided",
            Some("invalid_api_key"),
            Some("invalid_request_error"),
        );
        assert!(!should_retry_openai_error(&err));
        let mapped = map_openai_error(err);
        assert_eq!(mapped.status(), None);
        assert_eq!(mapped.message(), "Incorrect API key provided");
    }

    #[test]
    fn test_other_errors_are_transport() {
        let err = OpenAIError::InvalidArgument("bad base url".to_string());
        assert!(!should_retry_openai_error(&err));
        assert!(matches!(map_openai_error(err), AiError::Transport { .. }));
    }
}
