//! Completion engine for OpenAI-compatible HTTP upstreams
use super::{ChunkStream, CompletionEngine, EngineRequest};
use crate::client::HttpClient;
use crate::errors::{EngineError, ErrorKind};
use crate::sse::{SseBufferedStream, SseItem, parse_event};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Uri, header};
use futures_util::future::ready;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Upper bound on how much of an upstream error body we read for its message.
const MAX_ERROR_BODY: usize = 64 * 1024;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1/";

#[derive(Debug, Clone)]
pub struct HttpEngine<T: HttpClient> {
    client: T,
    default_base: Url,
}

enum Frame {
    Item(Result<Value, EngineError>),
    Done,
}

impl<T: HttpClient> HttpEngine<T> {
    /// `default_base` is used for requests whose alias and provider name no endpoint.
    pub fn new(client: T, default_base: Url) -> Self {
        Self {
            client,
            default_base,
        }
    }

    fn endpoint(&self, request: &EngineRequest) -> Result<Uri, EngineError> {
        let mut base = request
            .api_base
            .clone()
            .unwrap_or_else(|| self.default_base.clone());
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let url = base.join("chat/completions").map_err(|e| {
            EngineError::new(ErrorKind::Unclassified, format!("Invalid api_base {base}: {e}"))
        })?;
        Uri::try_from(url.as_str()).map_err(|e| {
            EngineError::new(ErrorKind::Unclassified, format!("Invalid upstream URI {url}: {e}"))
        })
    }

    fn build(&self, request: &EngineRequest) -> Result<axum::extract::Request, EngineError> {
        let uri = self.endpoint(request)?;
        let body = serde_json::to_vec(&request.body())
            .map_err(|e| EngineError::new(ErrorKind::Unclassified, e.to_string()))?;

        let mut builder = axum::http::Request::builder()
            .method(Method::POST)
            .header(header::CONTENT_TYPE, "application/json");

        // Some fronting proxies reject requests whose host header doesn't match the upstream
        if let Some(host) = uri.host() {
            let host = match uri.port_u16() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            builder = builder.header(header::HOST, host);
        }
        match &request.api_key {
            Some(key) => builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}")),
            None => debug!("No credential for {}", uri),
        }
        if request.is_streaming() {
            builder = builder.header(header::ACCEPT, "text/event-stream");
        }

        builder
            .uri(uri)
            .body(Body::from(body))
            .map_err(|e| EngineError::new(ErrorKind::Unclassified, e.to_string()))
    }

    /// Send the request and return the response once the upstream accepted it.
    async fn open(&self, request: &EngineRequest) -> Result<axum::response::Response, EngineError> {
        let req = self.build(request)?;
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| EngineError::new(ErrorKind::Connection, e.to_string()))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(upstream_error(response).await)
        }
    }
}

fn deadline(request: &EngineRequest) -> Option<Duration> {
    // A zero timeout means "no deadline" for the HTTP engine
    request
        .timeout_seconds
        .get()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

async fn with_deadline<F: Future>(
    deadline: Option<Duration>,
    fut: F,
) -> Result<F::Output, EngineError> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            EngineError::new(
                ErrorKind::Timeout,
                format!("Request timed out after {}s", limit.as_secs()),
            )
        }),
        None => Ok(fut.await),
    }
}

async fn upstream_error(response: axum::response::Response) -> EngineError {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), MAX_ERROR_BODY)
        .await
        .unwrap_or_default();

    let message = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| error_message(&v))
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(&bytes).trim().to_string();
            if text.is_empty() { status.to_string() } else { text }
        });

    warn!(status = %status, "Upstream returned an error: {}", message);
    EngineError::new(ErrorKind::from_status(status), message)
}

fn error_message(payload: &Value) -> Option<String> {
    let error = payload.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}

/// Classify an `{"error": ...}` object delivered with a success status or inside a stream.
fn in_band_error(payload: &Value) -> EngineError {
    let error = &payload["error"];
    let status = error
        .get("code")
        .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
        .and_then(|c| u16::try_from(c).ok())
        .and_then(|c| axum::http::StatusCode::from_u16(c).ok());
    let kind = match status {
        Some(status) => ErrorKind::from_status(status),
        None => match error.get("type").and_then(Value::as_str) {
            Some("rate_limit_error") => ErrorKind::RateLimited,
            Some("authentication_error") => ErrorKind::Authentication,
            Some("overloaded_error") => ErrorKind::Unavailable,
            _ => ErrorKind::Unclassified,
        },
    };
    let message = error_message(payload).unwrap_or_else(|| error.to_string());
    EngineError::new(kind, message)
}

fn frames(event: Result<bytes::Bytes, axum::Error>) -> Vec<Frame> {
    let event = match event {
        Ok(event) => event,
        Err(e) => {
            return vec![Frame::Item(Err(EngineError::new(
                ErrorKind::Connection,
                format!("Upstream stream failed: {e}"),
            )))];
        }
    };
    parse_event(&event)
        .into_iter()
        .filter_map(|item| match item {
            SseItem::Chunk(chunk) => Some(Frame::Item(Ok(chunk))),
            SseItem::Error(payload) => Some(Frame::Item(Err(in_band_error(&payload)))),
            SseItem::Done => Some(Frame::Done),
            SseItem::Malformed(data) => {
                debug!("Skipping non-JSON stream data: {}", data);
                None
            }
        })
        .collect()
}

#[async_trait]
impl<T: HttpClient + 'static> CompletionEngine for HttpEngine<T> {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: &EngineRequest) -> Result<Value, EngineError> {
        let call = async {
            let response = self.open(request).await?;
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .map_err(|e| EngineError::new(ErrorKind::Connection, e.to_string()))?;
            serde_json::from_slice::<Value>(&bytes).map_err(|e| {
                EngineError::new(
                    ErrorKind::Unclassified,
                    format!("Upstream returned invalid JSON: {e}"),
                )
            })
        };
        let payload = with_deadline(deadline(request), call).await??;

        if payload.get("error").is_some_and(|e| !e.is_null()) {
            return Err(in_band_error(&payload));
        }
        Ok(payload)
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn stream(&self, request: &EngineRequest) -> Result<ChunkStream, EngineError> {
        let response = with_deadline(deadline(request), self.open(request)).await??;

        let chunks = SseBufferedStream::new(response.into_body().into_data_stream())
            .flat_map(|event| stream::iter(frames(event)))
            .take_while(|frame| ready(!matches!(frame, Frame::Done)))
            .filter_map(|frame| {
                ready(match frame {
                    Frame::Item(item) => Some(item),
                    Frame::Done => None,
                })
            });
        Ok(Box::pin(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::engine::StreamMode;
    use crate::params::Param;
    use crate::test_utils::MockHttpClient;
    use axum::http::StatusCode;
    use serde_json::json;

    fn engine(client: MockHttpClient) -> HttpEngine<MockHttpClient> {
        HttpEngine::new(client, DEFAULT_API_BASE.parse().unwrap())
    }

    fn request(mode: StreamMode) -> EngineRequest {
        let mut request = EngineRequest::new(
            "openai/gpt-4.1-mini",
            vec![json!({"role": "user", "content": "hi"})],
            mode,
        );
        request.api_key = Some("sk-test".into());
        request
    }

    #[tokio::test]
    async fn test_complete_posts_to_chat_completions() {
        let client = MockHttpClient::new(StatusCode::OK, r#"{"id": "cmpl-1", "choices": []}"#);
        let response = engine(client.clone())
            .complete(&request(StreamMode::Complete))
            .await
            .unwrap();

        assert_eq!(response["id"], "cmpl-1");
        let sent = client.get_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "POST");
        assert_eq!(sent[0].uri, "https://api.openai.com/v1/chat/completions");
        assert!(
            sent[0]
                .headers
                .contains(&("authorization".to_string(), "Bearer sk-test".to_string()))
        );
        let body: Value = serde_json::from_slice(&sent[0].body).unwrap();
        assert_eq!(body["model"], "gpt-4.1-mini");
    }

    #[tokio::test]
    async fn test_alias_api_base_without_trailing_slash() {
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let mut req = request(StreamMode::Complete);
        req.api_base = Some("http://localhost:8000/v1".parse().unwrap());

        engine(client.clone()).complete(&req).await.unwrap();

        assert_eq!(
            client.get_requests()[0].uri,
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_upstream_status_is_classified() {
        let client = MockHttpClient::new(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "quota exhausted"}}"#,
        );
        let err = engine(client)
            .complete(&request(StreamMode::Complete))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(err.message, "quota exhausted");
    }

    #[tokio::test]
    async fn test_plain_text_error_body() {
        let client = MockHttpClient::new(StatusCode::UNAUTHORIZED, "nope");
        let err = engine(client)
            .complete(&request(StreamMode::Complete))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(err.message, "nope");
    }

    #[tokio::test]
    async fn test_stream_yields_chunks_until_done() {
        let client = MockHttpClient::new_streaming(
            StatusCode::OK,
            vec![
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"}}]}\n\n".into(),
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"}}]}\n\ndata: [DONE]\n\n".into(),
                "data: {\"ignored\":true}\n\n".into(),
            ],
        );
        let chunks: Vec<_> = engine(client.clone())
            .stream(&request(StreamMode::Stream))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].as_ref().unwrap()["choices"][0]["delta"]["content"], "llo");

        let body: Value = serde_json::from_slice(&client.get_requests()[0].body).unwrap();
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[tokio::test]
    async fn test_in_band_stream_error() {
        let client = MockHttpClient::new_streaming(
            StatusCode::OK,
            vec![
                "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"}}]}\n\n".into(),
                "data: {\"error\":{\"message\":\"overloaded\",\"code\":503}}\n\n".into(),
            ],
        );
        let chunks: Vec<_> = engine(client)
            .stream(&request(StreamMode::Stream))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        let err = chunks[1].as_ref().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert_eq!(err.message, "overloaded");
    }

    #[derive(Debug)]
    struct RefusingClient;

    #[async_trait]
    impl HttpClient for RefusingClient {
        async fn request(
            &self,
            _req: axum::extract::Request,
        ) -> Result<axum::response::Response, ClientError> {
            Err("connection refused".into())
        }
    }

    #[derive(Debug)]
    struct StalledClient;

    #[async_trait]
    impl HttpClient for StalledClient {
        async fn request(
            &self,
            _req: axum::extract::Request,
        ) -> Result<axum::response::Response, ClientError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err("unreachable".into())
        }
    }

    #[tokio::test]
    async fn test_transport_failure_is_connection_error() {
        let engine = HttpEngine::new(RefusingClient, DEFAULT_API_BASE.parse().unwrap());
        let err = engine
            .complete(&request(StreamMode::Complete))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let engine = HttpEngine::new(StalledClient, DEFAULT_API_BASE.parse().unwrap());
        let mut req = request(StreamMode::Stream);
        req.timeout_seconds = Param::Explicit(1);

        let err = match engine.stream(&req).await {
            Err(e) => e,
            Ok(_) => panic!("stalled upstream should time out"),
        };
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
