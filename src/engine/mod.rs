//! The boundary to the completion engine
//!
//! The engine is whatever actually runs the model call. Everything it returns crosses this
//! boundary as either a JSON payload or a classified [`EngineError`], so the dispatcher only
//! ever branches on the closed taxonomy in [`crate::errors::ErrorKind`].
//!
//! - [`http::HttpEngine`] talks to OpenAI-compatible upstreams
//! - [`retry::Retrying`] wraps any engine with the retry policy for retryable failures
pub mod http;
pub mod retry;

use crate::errors::EngineError;
use crate::params::Param;
use crate::provider::upstream_model_name;
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::{Map, Value, json};
use std::pin::Pin;
use url::Url;

/// Chunks of a streamed completion, in the order the engine produced them.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, EngineError>> + Send>>;

/// Whether the engine should stream. Streaming calls always ask for usage in the final chunk;
/// without it token counts and cost would silently be recorded as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Complete,
    Stream,
}

/// A fully-resolved call to the completion engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    /// Provider model id, or the client's raw model name when the alias isn't configured.
    pub model: String,
    pub messages: Vec<Value>,
    pub mode: StreamMode,
    /// The resolved secret. Never persisted.
    pub api_key: Option<String>,
    pub api_base: Option<Url>,
    pub timeout_seconds: Param<u64>,
    pub max_retries: Param<u32>,
    pub temperature: Param<f64>,
    pub max_tokens: Param<u64>,
    pub top_p: Param<f64>,
    /// Remaining parameters, already merged.
    pub extra: Map<String, Value>,
}

impl EngineRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Value>, mode: StreamMode) -> Self {
        Self {
            model: model.into(),
            messages,
            mode,
            api_key: None,
            api_base: None,
            timeout_seconds: Param::Unset,
            max_retries: Param::Unset,
            temperature: Param::Unset,
            max_tokens: Param::Unset,
            top_p: Param::Unset,
            extra: Map::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.mode == StreamMode::Stream
    }

    /// Sampling and passthrough parameters, in the shape the upstream API expects.
    fn parameters(&self) -> Map<String, Value> {
        let mut params = self.extra.clone();
        if let Some(v) = self.temperature.get() {
            params.insert("temperature".into(), json!(v));
        }
        if let Some(v) = self.top_p.get() {
            params.insert("top_p".into(), json!(v));
        }
        if let Some(v) = self.max_tokens.get() {
            params.insert("max_tokens".into(), json!(v));
        }
        params
    }

    /// The JSON body sent upstream.
    pub fn body(&self) -> Value {
        let mut body = self.parameters();
        body.insert(
            "model".into(),
            Value::String(upstream_model_name(&self.model).to_string()),
        );
        body.insert("messages".into(), Value::Array(self.messages.clone()));
        match self.mode {
            StreamMode::Stream => {
                body.insert("stream".into(), Value::Bool(true));
                body.insert("stream_options".into(), json!({"include_usage": true}));
            }
            StreamMode::Complete => {
                body.remove("stream");
                body.remove("stream_options");
            }
        }
        Value::Object(body)
    }

    /// The request as recorded in the audit log: the full provider model id, every resolved
    /// parameter and no credential.
    pub fn log_payload(&self) -> Value {
        let mut payload = self.parameters();
        payload.insert("model".into(), Value::String(self.model.clone()));
        payload.insert("messages".into(), Value::Array(self.messages.clone()));
        payload.insert("stream".into(), Value::Bool(self.is_streaming()));
        if let Some(v) = self.timeout_seconds.get() {
            payload.insert("timeout".into(), json!(v));
        }
        if let Some(v) = self.max_retries.get() {
            payload.insert("num_retries".into(), json!(v));
        }
        payload.remove("api_key");
        Value::Object(payload)
    }
}

#[async_trait]
pub trait CompletionEngine: std::fmt::Debug + Send + Sync {
    /// Run a completion and return the full response object.
    async fn complete(&self, request: &EngineRequest) -> Result<Value, EngineError>;

    /// Start a streamed completion. Errors before the first chunk are returned here; errors
    /// after that arrive as items of the stream.
    async fn stream(&self, request: &EngineRequest) -> Result<ChunkStream, EngineError>;
}
