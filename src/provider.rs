/// Provider inference for provider model ids.
///
/// A provider model id is either prefixed (`openai/gpt-4.1`) or bare (`gpt-4.1`). The prefix is
/// authoritative; bare ids fall back to well-known naming patterns.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// Infer the provider name from a provider model id.
pub fn infer_provider(model: &str) -> String {
    if model.is_empty() {
        return UNKNOWN_PROVIDER.to_string();
    }

    if let Some((prefix, _)) = model.split_once('/') {
        return prefix.to_string();
    }

    let lower = model.to_lowercase();
    let provider = if ["gpt-", "o1-", "text-davinci", "text-curie"]
        .iter()
        .any(|p| lower.starts_with(p))
    {
        "openai"
    } else if lower.contains("claude") {
        "anthropic"
    } else if lower.starts_with("gemini") || lower.starts_with("palm") {
        "google"
    } else if lower.starts_with("mistral") {
        "mistral"
    } else if lower.starts_with("llama") {
        "meta"
    } else {
        UNKNOWN_PROVIDER
    };
    provider.to_string()
}

/// Strip the provider prefix, leaving the model name the upstream API expects.
pub fn upstream_model_name(model: &str) -> &str {
    model.split_once('/').map(|(_, rest)| rest).unwrap_or(model)
}
