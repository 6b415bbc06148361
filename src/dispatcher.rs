//! Request dispatch: resolve, call the engine, reconstruct streams, record the attempt
//!
//! Every call to [`Dispatcher::complete`] or [`Dispatcher::stream`] produces exactly one
//! [`RequestRecord`], whether the engine succeeds, fails before the first chunk, fails mid-stream
//! or the client goes away. Retries happen inside the engine, never here.
use crate::accumulator::{StreamAccumulator, StreamOutcome};
use crate::aliases::{Aliases, ConfigSnapshot, RoutingParams};
use crate::engine::{ChunkStream, CompletionEngine, EngineRequest, StreamMode};
use crate::errors::{EngineError, ErrorKind, error_response};
use crate::models::ChatCompletionRequest;
use crate::params::{Param, merge_json};
use crate::pricing::Usage;
use crate::provider::infer_provider;
use crate::sse::{DONE_EVENT, data_event};
use crate::store::{Outcome, RecordSink, RequestRecord, StoreError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};

/// Server-sent events delivered to the client, already framed.
pub type SseStream = ReceiverStream<Result<Bytes, Infallible>>;

/// Parameters the proxy never forwards from the client's passthrough set.
const RESERVED_PARAMS: &[&str] = &["api_key", "stream", "stream_options"];

/// Lowest-precedence values, used when neither the client nor the alias sets one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalDefaults {
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The engine failed. The attempt has already been recorded.
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to record request: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            DispatchError::Engine(e) => e.into_response(),
            DispatchError::Store(e) => {
                error!("Request log write failed: {}", e);
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Unclassified.error_type(),
                    "Failed to record request",
                    "storage_error",
                )
            }
        }
    }
}

/// Everything fixed at the start of one dispatch attempt.
#[derive(Debug)]
struct Attempt {
    alias: String,
    provider: String,
    request: EngineRequest,
    snapshot: Arc<ConfigSnapshot>,
    started: Instant,
}

impl Attempt {
    fn record(&self, usage: Usage, outcome: Outcome) -> RequestRecord {
        RequestRecord {
            timestamp: Utc::now(),
            model_alias: self.alias.clone(),
            provider: self.provider.clone(),
            cost_usd: self.snapshot.prices().cost(&self.request.model, &usage),
            usage,
            duration_ms: self.started.elapsed().as_millis() as u64,
            request: self.request.log_payload(),
            outcome,
        }
    }

    fn log(&self, record: &RequestRecord) {
        let streaming = if self.request.is_streaming() {
            " [streaming]"
        } else {
            ""
        };
        match &record.outcome {
            Outcome::Success(_) => info!(
                "✓ {} ({}) | {}ms | {}→{} tokens ({} total) | ${:.4}{}",
                self.alias,
                self.provider,
                record.duration_ms,
                record.usage.prompt_tokens,
                record.usage.completion_tokens,
                record.usage.total_tokens,
                record.cost_usd,
                streaming
            ),
            Outcome::Failure(message) => warn!(
                "✗ {} ({}) | {}ms | {}{}",
                self.alias, self.provider, record.duration_ms, message, streaming
            ),
        }
    }
}

/// Owns the client's side of a stream. The client is marked gone the first time a write fails
/// or the receiving end is seen closed; later writes are dropped without further logging.
struct ClientSink {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    disconnected: bool,
}

impl ClientSink {
    async fn send(&mut self, event: impl Into<Bytes>) -> bool {
        if self.disconnected {
            return false;
        }
        if self.tx.send(Ok(event.into())).await.is_err() {
            self.mark_disconnected();
        }
        !self.disconnected
    }

    /// Resolves once the response body has been dropped, even if nothing is being written.
    async fn closed(&self) {
        self.tx.closed().await
    }

    fn mark_disconnected(&mut self) {
        if !self.disconnected {
            info!("Client disconnected during streaming");
            self.disconnected = true;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    aliases: Aliases,
    engine: Arc<dyn CompletionEngine>,
    sink: Arc<dyn RecordSink>,
    defaults: GlobalDefaults,
}

impl Dispatcher {
    pub fn new(
        aliases: Aliases,
        engine: Arc<dyn CompletionEngine>,
        sink: Arc<dyn RecordSink>,
        defaults: GlobalDefaults,
    ) -> Self {
        Self {
            aliases,
            engine,
            sink,
            defaults,
        }
    }

    pub fn aliases(&self) -> &Aliases {
        &self.aliases
    }

    /// Resolve the alias and merge parameters into the request sent to the engine.
    pub fn resolve(&self, request: &ChatCompletionRequest, mode: StreamMode) -> EngineRequest {
        let snapshot = self.aliases.snapshot();
        self.resolve_in(&snapshot, request, mode)
    }

    fn resolve_in(
        &self,
        snapshot: &ConfigSnapshot,
        request: &ChatCompletionRequest,
        mode: StreamMode,
    ) -> EngineRequest {
        let route = snapshot.resolve(&request.model);
        let Some(route) = route else {
            debug!(model = %request.model, "Alias not configured, passing model through");
            let mut engine_request =
                EngineRequest::new(request.model.clone(), request.messages.clone(), mode);
            engine_request.api_base = snapshot
                .provider_url(&infer_provider(&request.model))
                .cloned();
            self.merge_params(&mut engine_request, request, None);
            return engine_request;
        };

        let mut engine_request =
            EngineRequest::new(route.provider_model_id.clone(), request.messages.clone(), mode);
        engine_request.api_key = route.credential_ref.resolve();
        if engine_request.api_key.is_none() {
            warn!(
                alias = %route.model_alias,
                "Credential {} is not set in the environment",
                route.credential_ref.var_name()
            );
        }
        engine_request.api_base = route
            .api_base
            .clone()
            .or_else(|| snapshot.provider_url(&route.provider()).cloned());
        self.merge_params(&mut engine_request, request, Some(route.as_ref()));
        engine_request
    }

    fn merge_params(
        &self,
        engine_request: &mut EngineRequest,
        request: &ChatCompletionRequest,
        route: Option<&RoutingParams>,
    ) {
        engine_request.timeout_seconds =
            Param::merge(request.timeout, route.and_then(|r| r.timeout_seconds))
                .or_default(self.defaults.timeout_seconds);
        engine_request.max_retries =
            Param::merge(request.num_retries, route.and_then(|r| r.max_retries))
                .or_default(self.defaults.max_retries);
        engine_request.temperature =
            Param::merge(request.temperature, route.and_then(|r| r.temperature));
        engine_request.max_tokens =
            Param::merge(request.max_tokens, route.and_then(|r| r.max_tokens));
        engine_request.top_p = Param::merge(request.top_p, route.and_then(|r| r.top_p));

        let empty = Map::new();
        let defaults = route.map(|r| &r.extra).unwrap_or(&empty);
        let mut extra = Map::new();
        for key in defaults.keys().chain(request.extra.keys()) {
            if RESERVED_PARAMS.contains(&key.as_str()) || extra.contains_key(key) {
                continue;
            }
            if let Some(value) = merge_json(request.extra.get(key), defaults.get(key)).into_value()
            {
                extra.insert(key.clone(), value);
            }
        }
        engine_request.extra = extra;
    }

    fn begin(&self, request: &ChatCompletionRequest, mode: StreamMode) -> Attempt {
        let started = Instant::now();
        let snapshot = self.aliases.snapshot();
        let engine_request = self.resolve_in(&snapshot, request, mode);
        let provider = infer_provider(&engine_request.model);
        info!(
            "→ {} ({}){}",
            request.model,
            engine_request.model,
            if engine_request.is_streaming() { " [streaming]" } else { "" }
        );
        Attempt {
            alias: request.model.clone(),
            provider,
            request: engine_request,
            snapshot,
            started,
        }
    }

    async fn persist(&self, attempt: &Attempt, usage: Usage, outcome: Outcome) -> Result<i64, StoreError> {
        let record = attempt.record(usage, outcome);
        attempt.log(&record);
        self.sink.append(record).await
    }

    /// Run a non-streaming completion. The response is returned unchanged once it is recorded.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn complete(&self, request: ChatCompletionRequest) -> Result<Value, DispatchError> {
        let attempt = self.begin(&request, StreamMode::Complete);

        match self.engine.complete(&attempt.request).await {
            Ok(response) => {
                let usage = Usage::from_response(&response);
                self.persist(&attempt, usage, Outcome::Success(response.clone()))
                    .await?;
                Ok(response)
            }
            Err(e) => {
                self.persist(&attempt, Usage::default(), Outcome::Failure(e.record_message()))
                    .await?;
                Err(DispatchError::Engine(e))
            }
        }
    }

    /// Open a streamed completion.
    ///
    /// A failure to open the stream is returned as an error. Once the engine accepts the request,
    /// a background task forwards each chunk to the returned stream as it arrives and records the
    /// attempt after the client has been sent the terminator.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn stream(&self, request: ChatCompletionRequest) -> Result<SseStream, DispatchError> {
        let attempt = self.begin(&request, StreamMode::Stream);

        let chunks = match self.engine.stream(&attempt.request).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.persist(&attempt, Usage::default(), Outcome::Failure(e.record_message()))
                    .await?;
                return Err(DispatchError::Engine(e));
            }
        };

        let (tx, rx) = mpsc::channel(1);
        let client = ClientSink {
            tx,
            disconnected: false,
        };
        tokio::spawn(self.clone().pump(attempt, chunks, client));
        Ok(ReceiverStream::new(rx))
    }

    async fn pump(self, attempt: Attempt, mut chunks: ChunkStream, mut client: ClientSink) {
        let mut accumulator = StreamAccumulator::new(attempt.request.model.clone());

        loop {
            // A stalled engine must not hide a client that has already gone
            let next = tokio::select! {
                item = chunks.next() => Some(item),
                () = client.closed() => None,
            };
            let Some(item) = next else {
                client.mark_disconnected();
                accumulator.fail(client_disconnected(&accumulator));
                break;
            };
            let Some(item) = item else {
                break;
            };
            match item {
                Ok(chunk) => {
                    if !client.send(data_event(&chunk)).await {
                        accumulator.fail(client_disconnected(&accumulator));
                        break;
                    }
                    accumulator.feed(&chunk);
                }
                Err(e) => {
                    accumulator.fail(e.record_message());
                    client.send(e.envelope().to_sse()).await;
                    break;
                }
            }
        }
        // Stop pulling from the engine before anything else
        drop(chunks);

        client.send(DONE_EVENT).await;
        // Closing the channel ends the response body, so the client is done before we write
        drop(client);

        let (usage, outcome) = match accumulator.finalize() {
            StreamOutcome::Success { response, usage } => (usage, Outcome::Success(response)),
            StreamOutcome::Failure { message, usage } => (usage, Outcome::Failure(message)),
        };
        if let Err(e) = self.persist(&attempt, usage, outcome).await {
            error!(model = %attempt.alias, "Failed to record streamed request: {}", e);
        }
    }
}

fn client_disconnected(accumulator: &StreamAccumulator) -> String {
    format!(
        "ClientDisconnected: client closed the stream after {} chunks",
        accumulator.chunks()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::CredentialRef;
    use crate::pricing::{PriceTable, TokenPricing};
    use crate::test_utils::{FailingSink, RecordingSink, ScriptedEngine};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn snapshot() -> ConfigSnapshot {
        let fast = RoutingParams::builder()
            .model_alias("fast".to_string())
            .provider_model_id("openai/gpt-4.1-mini".to_string())
            .credential_ref(CredentialRef::env("TALLYPROXY_TEST_DISPATCH_KEY"))
            .timeout_seconds(30)
            .max_retries(2)
            .temperature(0.7)
            .extra(Map::from_iter([
                ("seed".to_string(), json!(1)),
                ("user".to_string(), json!("config")),
            ]))
            .build();
        let mut prices = HashMap::new();
        prices.insert(
            "openai/gpt-4.1-mini".to_string(),
            TokenPricing {
                input_cost_per_token: 0.000001,
                output_cost_per_token: 0.000002,
            },
        );
        ConfigSnapshot::new([fast], HashMap::new(), PriceTable::new(prices))
    }

    fn dispatcher(engine: ScriptedEngine, sink: Arc<dyn RecordSink>) -> Dispatcher {
        Dispatcher::new(
            Aliases::new(snapshot()),
            Arc::new(engine),
            sink,
            GlobalDefaults {
                timeout_seconds: Some(120),
                max_retries: Some(3),
            },
        )
    }

    fn chat(model: &str, extra: Value) -> ChatCompletionRequest {
        let mut body = json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}]
        });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            body.extend(extra.clone());
        }
        serde_json::from_value(body).unwrap()
    }

    fn chunk(content: &str) -> Value {
        json!({"id": "c1", "model": "gpt-4.1-mini", "choices": [{"index": 0, "delta": {"content": content}}]})
    }

    async fn body_text(stream: SseStream) -> String {
        let parts: Vec<_> = stream.collect().await;
        parts
            .into_iter()
            .map(|p| String::from_utf8(p.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_alias_default_applies_without_client_value() {
        let d = dispatcher(ScriptedEngine::new(), Arc::new(RecordingSink::new()));
        let resolved = d.resolve(&chat("fast", json!({})), StreamMode::Complete);

        assert_eq!(resolved.model, "openai/gpt-4.1-mini");
        assert_eq!(resolved.timeout_seconds, Param::Default(30));
        assert_eq!(resolved.max_retries, Param::Default(2));
        assert_eq!(resolved.temperature, Param::Default(0.7));
        assert_eq!(resolved.top_p, Param::Unset);
    }

    #[test]
    fn test_explicit_zero_overrides_default() {
        let d = dispatcher(ScriptedEngine::new(), Arc::new(RecordingSink::new()));
        let resolved = d.resolve(
            &chat("fast", json!({"timeout": 0, "temperature": 0.0, "num_retries": 0})),
            StreamMode::Complete,
        );

        assert_eq!(resolved.timeout_seconds, Param::Explicit(0));
        assert_eq!(resolved.temperature, Param::Explicit(0.0));
        assert_eq!(resolved.max_retries, Param::Explicit(0));
    }

    #[test]
    fn test_null_falls_back_to_default() {
        let d = dispatcher(ScriptedEngine::new(), Arc::new(RecordingSink::new()));
        let resolved = d.resolve(
            &chat("fast", json!({"temperature": null, "user": null, "seed": 9})),
            StreamMode::Complete,
        );

        assert_eq!(resolved.temperature, Param::Default(0.7));
        assert_eq!(resolved.extra.get("user"), Some(&json!("config")));
        assert_eq!(resolved.extra.get("seed"), Some(&json!(9)));
    }

    #[test]
    fn test_unknown_alias_passes_through_with_global_defaults() {
        let d = dispatcher(ScriptedEngine::new(), Arc::new(RecordingSink::new()));
        let resolved = d.resolve(
            &chat("anthropic/claude-3-5-haiku", json!({"api_key": "sk-client"})),
            StreamMode::Stream,
        );

        assert_eq!(resolved.model, "anthropic/claude-3-5-haiku");
        assert_eq!(resolved.timeout_seconds, Param::Default(120));
        assert_eq!(resolved.max_retries, Param::Default(3));
        assert_eq!(resolved.api_key, None);
        assert!(!resolved.extra.contains_key("api_key"));
        assert_eq!(resolved.body()["stream_options"]["include_usage"], true);
    }

    #[tokio::test]
    async fn test_successful_completion_records_once() {
        let response = json!({
            "id": "cmpl-1",
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        });
        let sink = Arc::new(RecordingSink::new());
        let engine = ScriptedEngine::new().respond(response.clone());
        let d = dispatcher(engine.clone(), sink.clone());

        let returned = d.complete(chat("fast", json!({}))).await.unwrap();

        assert_eq!(returned, response);
        let sent = engine.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].model, "openai/gpt-4.1-mini");
        assert_eq!(sent[0].mode, StreamMode::Complete);
        assert_eq!(sent[0].temperature, Param::Default(0.7));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.outcome, Outcome::Success(response));
        assert_eq!(record.model_alias, "fast");
        assert_eq!(record.provider, "openai");
        assert_eq!(record.usage.total_tokens, 6);
        assert!((record.cost_usd - 0.000007).abs() < 1e-12);
        assert_eq!(record.request["model"], "openai/gpt-4.1-mini");
        assert_eq!(record.request["timeout"], 30);
    }

    #[tokio::test]
    async fn test_engine_failure_records_error() {
        let sink = Arc::new(RecordingSink::new());
        let d = dispatcher(
            ScriptedEngine::new().fail(ErrorKind::Authentication, "bad key"),
            sink.clone(),
        );

        let err = d.complete(chat("fast", json!({}))).await.unwrap_err();

        assert!(matches!(err, DispatchError::Engine(ref e) if e.kind == ErrorKind::Authentication));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].outcome,
            Outcome::Failure("AuthenticationError: bad key".into())
        );
        assert_eq!(records[0].cost_usd, 0.0);
    }

    #[tokio::test]
    async fn test_store_failure_propagates_on_non_streaming_path() {
        let d = dispatcher(
            ScriptedEngine::new().respond(json!({"choices": []})),
            Arc::new(FailingSink),
        );
        let err = d.complete(chat("fast", json!({}))).await.unwrap_err();
        assert!(matches!(err, DispatchError::Store(_)));
    }

    #[tokio::test]
    async fn test_stream_forwards_in_order_and_records_synthetic_response() {
        let pieces = ["The", " quick", " brown", " fox"];
        let mut chunks: Vec<Value> = pieces.iter().map(|p| chunk(p)).collect();
        chunks.push(json!({
            "id": "c1",
            "choices": [],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
        }));
        let sink = Arc::new(RecordingSink::new());
        let d = dispatcher(ScriptedEngine::new().stream_chunks(chunks), sink.clone());

        let stream = d.stream(chat("fast", json!({"stream": true}))).await.unwrap();
        let body = body_text(stream).await;

        let forwarded: String = body
            .split("\n\n")
            .filter_map(|event| event.strip_prefix("data: "))
            .filter(|data| *data != "[DONE]")
            .filter_map(|data| serde_json::from_str::<Value>(data).ok())
            .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(str::to_string))
            .collect();
        assert_eq!(forwarded, pieces.concat());
        assert!(body.ends_with(DONE_EVENT));

        let records = sink.wait_for(1).await;
        assert_eq!(records.len(), 1);
        let Outcome::Success(response) = &records[0].outcome else {
            panic!("expected success");
        };
        assert_eq!(response["choices"][0]["message"]["content"], forwarded);
        assert_eq!(records[0].usage.total_tokens, 7);
        assert!(records[0].cost_usd > 0.0);
    }

    #[tokio::test]
    async fn test_mid_stream_error_sends_envelope_then_done() {
        let sink = Arc::new(RecordingSink::new());
        let d = dispatcher(
            ScriptedEngine::new().stream_then_fail(
                vec![chunk("partial")],
                ErrorKind::Unavailable,
                "overloaded",
            ),
            sink.clone(),
        );

        let body = body_text(d.stream(chat("fast", json!({}))).await.unwrap()).await;
        let events: Vec<&str> = body.split_terminator("\n\n").collect();

        assert_eq!(events.len(), 3);
        assert!(events[1].contains("\"service_unavailable\""));
        assert_eq!(events[2], "data: [DONE]");

        let records = sink.wait_for(1).await;
        assert_eq!(
            records[0].outcome,
            Outcome::Failure("ProviderError: overloaded".into())
        );
    }

    #[tokio::test]
    async fn test_stream_open_failure_is_returned_and_recorded() {
        let sink = Arc::new(RecordingSink::new());
        let d = dispatcher(
            ScriptedEngine::new().fail_stream(ErrorKind::NotFound, "no such model"),
            sink.clone(),
        );

        let err = d.stream(chat("fast", json!({}))).await.unwrap_err();
        assert!(matches!(err, DispatchError::Engine(ref e) if e.kind == ErrorKind::NotFound));
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_client_disconnect_records_single_error() {
        let chunks: Vec<Value> = (0..10).map(|i| chunk(&format!("{i} "))).collect();
        let sink = Arc::new(RecordingSink::new());
        let d = dispatcher(ScriptedEngine::new().stream_chunks(chunks), sink.clone());

        let mut stream = d.stream(chat("fast", json!({}))).await.unwrap();
        for _ in 0..3 {
            stream.next().await.unwrap().unwrap();
        }
        drop(stream);

        let records = sink.wait_for(1).await;
        // give a second write, if there were one, the chance to land
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.records().len(), 1);
        let error = records[0].outcome.error().unwrap();
        assert!(error.starts_with("ClientDisconnected"), "{error}");
    }

    #[tokio::test]
    async fn test_client_disconnect_while_engine_stalls_is_recorded() {
        let sink = Arc::new(RecordingSink::new());
        let d = dispatcher(
            ScriptedEngine::new().stream_then_stall(vec![chunk("first")]),
            sink.clone(),
        );

        let mut stream = d.stream(chat("fast", json!({}))).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("first"));
        drop(stream);

        let records = sink.wait_for(1).await;
        assert_eq!(records.len(), 1);
        let error = records[0].outcome.error().unwrap();
        assert_eq!(
            error,
            "ClientDisconnected: client closed the stream after 1 chunks"
        );
    }

    #[tokio::test]
    async fn test_streaming_store_failure_is_swallowed() {
        let d = dispatcher(
            ScriptedEngine::new().stream_chunks(vec![chunk("ok")]),
            Arc::new(FailingSink),
        );
        let body = body_text(d.stream(chat("fast", json!({}))).await.unwrap()).await;
        assert!(body.ends_with(DONE_EVENT));
    }
}
