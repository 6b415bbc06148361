//! tallyproxy - a local LLM proxy that keeps a ledger of every request
//!
//! Clients send OpenAI-shaped chat completions naming an alias. The proxy resolves the alias to a
//! provider model and its defaults, forwards the call to a completion engine (streaming chunks
//! through as they arrive) and records tokens, cost, timing and the outcome of every attempt in
//! SQLite. The same database backs the usage and cost endpoints.

use axum::Router;
use axum::routing::{delete, get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod accumulator;
pub mod aliases;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod params;
pub mod pricing;
pub mod provider;
pub mod sse;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use aliases::Aliases;
use dispatcher::{Dispatcher, GlobalDefaults};
use engine::CompletionEngine;
use store::SqliteStore;

/// Shared state for every handler: the dispatcher for completions and the store for reads.
#[derive(Clone, Debug)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub store: SqliteStore,
}

impl AppState {
    /// Wire a dispatcher that records into `store`.
    pub fn new(
        aliases: Aliases,
        engine: Arc<dyn CompletionEngine>,
        store: SqliteStore,
        defaults: GlobalDefaults,
    ) -> Self {
        let dispatcher = Dispatcher::new(aliases, engine, Arc::new(store.clone()), defaults);
        Self { dispatcher, store }
    }
}

/// Build the main router for the proxy
/// This creates routes for:
/// - `/v1/chat/completions` and `/chat/completions` - Dispatch a completion
/// - `/health` and `/models` - Liveness and the configured aliases
/// - `/stats`, `/stats/daily`, `/stats/hourly`, `/stats/date-range` and `/requests` - Ledger reads
/// - `DELETE /errors` - Drop failed-request records
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::models))
        .route("/stats", get(handlers::stats))
        .route("/stats/daily", get(handlers::daily_stats))
        .route("/stats/hourly", get(handlers::hourly_stats))
        .route("/stats/date-range", get(handlers::date_range))
        .route("/requests", get(handlers::requests))
        .route("/errors", delete(handlers::clear_errors))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// The prefix must live for the whole program, as the Prometheus registry is global.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::{ConfigSnapshot, CredentialRef, RoutingParams};
    use crate::errors::ErrorKind;
    use crate::pricing::{PriceTable, TokenPricing};
    use crate::test_utils::ScriptedEngine;
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use std::collections::HashMap;

    fn snapshot() -> ConfigSnapshot {
        let fast = RoutingParams::builder()
            .model_alias("fast")
            .provider_model_id("openai/gpt-4.1-mini")
            .credential_ref(CredentialRef::env("TALLYPROXY_TEST_LIB_KEY"))
            .timeout_seconds(30)
            .build();
        let prices = PriceTable::new(HashMap::from([(
            "openai/gpt-4.1-mini".to_string(),
            TokenPricing {
                input_cost_per_token: 0.0000004,
                output_cost_per_token: 0.0000016,
            },
        )]));
        ConfigSnapshot::new([fast], HashMap::new(), prices)
    }

    fn server(engine: ScriptedEngine) -> (TestServer, SqliteStore) {
        let store = SqliteStore::in_memory().unwrap();
        let state = AppState::new(
            Aliases::new(snapshot()),
            Arc::new(engine),
            store.clone(),
            GlobalDefaults::default(),
        );
        (TestServer::new(build_router(state)).unwrap(), store)
    }

    fn completion() -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4.1-mini",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (server, _) = server(ScriptedEngine::new());
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>(), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_models_lists_aliases_with_prices() {
        let (server, _) = server(ScriptedEngine::new());
        let body: Value = server.get("/models").await.json();

        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0]["name"], "fast");
        assert_eq!(models[0]["provider"], "openai");
        assert_eq!(models[0]["input_cost_per_million"], 0.4);
        assert_eq!(models[0]["output_cost_per_million"], 1.6);
    }

    #[tokio::test]
    async fn test_completion_is_returned_and_listed() {
        let (server, _) = server(ScriptedEngine::new().respond(completion()));

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": "fast", "messages": [{"role": "user", "content": "hello"}]}))
            .await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>(), completion());

        let page: Value = server.get("/requests").await.json();
        assert_eq!(page["total"], 1);
        assert_eq!(page["requests"][0]["model"], "fast");
        assert_eq!(page["requests"][0]["total_tokens"], 6);
        assert_eq!(page["requests"][0]["response_data"], completion());
    }

    #[tokio::test]
    async fn test_bare_path_is_routed() {
        let (server, _) = server(ScriptedEngine::new().respond(completion()));
        let response = server
            .post("/chat/completions")
            .json(&json!({"model": "fast", "messages": []}))
            .await;
        assert_eq!(response.status_code(), 200);
    }

    #[tokio::test]
    async fn test_engine_error_renders_envelope() {
        let (server, _) = server(ScriptedEngine::new().fail(ErrorKind::RateLimited, "slow down"));

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": "fast", "messages": []}))
            .await;

        assert_eq!(response.status_code(), 429);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "slow down", "type": "rate_limit_error", "code": "rate_limit_exceeded"}})
        );

        let stats: Value = server.get("/stats").await.json();
        assert_eq!(stats["totals"]["requests"], 0);
        assert_eq!(stats["recent_errors"][0]["error"], "RateLimitError: slow down");
    }

    #[tokio::test]
    async fn test_missing_model_is_bad_request() {
        let (server, _) = server(ScriptedEngine::new());
        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"messages": []}))
            .await;

        assert_eq!(response.status_code(), 400);
        assert_eq!(
            response.json::<Value>()["error"]["type"],
            "invalid_request_error"
        );
    }

    #[tokio::test]
    async fn test_streaming_response_is_event_stream() {
        let chunk = json!({"id": "c1", "choices": [{"index": 0, "delta": {"content": "hey"}}]});
        let (server, _) = server(ScriptedEngine::new().stream_chunks(vec![chunk]));

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": "fast", "messages": [], "stream": true}))
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("content-type"), "text/event-stream");
        let text = response.text();
        assert!(text.contains("\"hey\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_invalid_date_is_bad_request() {
        let (server, _) = server(ScriptedEngine::new());
        for path in [
            "/stats?start_date=yesterday",
            "/requests?end_date=2025-13-01",
            "/stats/daily?start_date=oops",
            "/stats/hourly?date=10-06-2025",
        ] {
            let response = server.get(path).await;
            assert_eq!(response.status_code(), 400, "{path}");
            assert_eq!(response.json::<Value>()["error"]["code"], "invalid_date");
        }
    }

    #[tokio::test]
    async fn test_hourly_defaults_to_today() {
        let (server, _) = server(ScriptedEngine::new());
        let body: Value = server.get("/stats/hourly?timezone_offset=60").await.json();
        assert_eq!(body["hourly"].as_array().unwrap().len(), 24);
        assert_eq!(body["total_requests"], 0);
    }

    #[tokio::test]
    async fn test_daily_and_date_range_cover_new_records() {
        let (server, _) = server(ScriptedEngine::new().respond(completion()));
        server
            .post("/v1/chat/completions")
            .json(&json!({"model": "fast", "messages": []}))
            .await;

        let daily: Value = server.get("/stats/daily").await.json();
        assert_eq!(daily["total_requests"], 1);

        let range: Value = server.get("/stats/date-range").await.json();
        assert!(range["start_date"].is_string());
        assert_eq!(range["start_date"], range["end_date"]);
    }

    #[tokio::test]
    async fn test_clear_errors() {
        let (server, _) = server(
            ScriptedEngine::new()
                .fail(ErrorKind::Authentication, "bad key")
                .respond(completion()),
        );
        for _ in 0..2 {
            server
                .post("/v1/chat/completions")
                .json(&json!({"model": "fast", "messages": []}))
                .await;
        }

        let response = server.delete("/errors").await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>(), json!({"deleted": 1}));

        let stats: Value = server.get("/stats").await.json();
        assert_eq!(stats["totals"]["requests"], 1);
        assert_eq!(stats["recent_errors"], json!([]));
    }

    mod metrics {
        use super::*;
        use rstest::*;

        /// The Prometheus registry is process-global, so every metrics test shares one pair of
        /// servers.
        #[fixture]
        #[once]
        fn get_shared_metrics_servers() -> (TestServer, TestServer) {
            let (prometheus_layer, handle) = build_metrics_layer_and_handle("tallyproxy");

            let metrics_router = build_metrics_router(handle);
            let metrics_server = TestServer::new(metrics_router).unwrap();

            let state = AppState::new(
                Aliases::new(snapshot()),
                Arc::new(ScriptedEngine::new()),
                SqliteStore::in_memory().unwrap(),
                GlobalDefaults::default(),
            );
            let router = build_router(state).layer(prometheus_layer);
            let server = TestServer::new(router).unwrap();

            (server, metrics_server)
        }

        fn health_count(metrics: &str) -> i32 {
            metrics
                .lines()
                .find(|line| {
                    line.contains("tallyproxy_http_requests_total{method=\"GET\",status=\"200\",endpoint=\"/health\"}")
                })
                .and_then(|line| line.split_whitespace().last())
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0)
        }

        #[rstest]
        #[tokio::test]
        async fn test_metrics_count_requests(get_shared_metrics_servers: &(TestServer, TestServer)) {
            let (server, metrics_server) = get_shared_metrics_servers;

            let initial_count = health_count(&metrics_server.get("/metrics").await.text());

            for _ in 0..3 {
                assert_eq!(server.get("/health").await.status_code(), 200);
            }

            let response = metrics_server.get("/metrics").await;
            assert_eq!(response.status_code(), 200);
            assert_eq!(
                health_count(&response.text()),
                initial_count + 3,
                "Metrics should increment by 3"
            );
        }
    }
}
