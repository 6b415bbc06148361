//! Wire shapes for the chat completion and model listing endpoints
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::aliases::ConfigSnapshot;
use crate::store::stats::round_to;

/// An OpenAI-shaped chat completion request.
///
/// The tunables the proxy merges with alias defaults are typed; everything else is carried in
/// `extra` and forwarded as-is. `null` deserializes to `None`, which means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub num_retries: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// One configured alias as listed by `/models`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub provider_model: String,
    pub provider: String,
    /// USD per million input tokens, when priced.
    pub input_cost_per_million: Option<f64>,
    pub output_cost_per_million: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelList {
    pub models: Vec<ModelInfo>,
}

impl ModelList {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        let per_million = |cost: f64| (cost > 0.0).then(|| round_to(cost * 1_000_000.0, 2));
        let models = snapshot
            .routes()
            .into_iter()
            .map(|route| {
                let pricing = snapshot.prices().lookup(&route.provider_model_id);
                ModelInfo {
                    name: route.model_alias.clone(),
                    provider_model: route.provider_model_id.clone(),
                    provider: route.provider(),
                    input_cost_per_million: pricing
                        .and_then(|p| per_million(p.input_cost_per_token)),
                    output_cost_per_million: pricing
                        .and_then(|p| per_million(p.output_cost_per_token)),
                }
            })
            .collect();
        ModelList { models }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_keeps_unknown_fields() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "fast",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0,
            "top_p": null,
            "seed": 42,
            "stream": true
        }))
        .unwrap();

        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.top_p, None);
        assert!(request.is_streaming());
        assert_eq!(request.extra.get("seed"), Some(&json!(42)));
        assert!(!request.extra.contains_key("top_p"));
    }

    #[test]
    fn test_request_requires_model() {
        let result: Result<ChatCompletionRequest, _> =
            serde_json::from_value(json!({"messages": []}));
        assert!(result.is_err());
    }
}
