//! Test doubles for the HTTP client, completion engine and record sink
use crate::client::{ClientError, HttpClient};
use crate::engine::{ChunkStream, CompletionEngine, EngineRequest};
use crate::errors::{EngineError, ErrorKind};
use crate::store::{RecordSink, RequestRecord, StoreError};
use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct MockHttpClient {
    pub requests: Arc<Mutex<Vec<MockRequest>>>,
    response_builder: Arc<dyn Fn() -> axum::response::Response + Send + Sync>,
}

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockHttpClient {
    pub fn new(status: StatusCode, body: &str) -> Self {
        let body = body.to_string();
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_builder: Arc::new(move || {
                axum::response::Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.clone()))
                    .unwrap()
            }),
        }
    }

    /// Serve an event stream, one body frame per entry of `chunks`.
    pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_builder: Arc::new(move || {
                use axum::body::Body;

                let stream = stream::iter(
                    chunks
                        .clone()
                        .into_iter()
                        .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
                );

                axum::response::Response::builder()
                    .status(status)
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(stream))
                    .unwrap()
            }),
        }
    }

    pub fn get_requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for MockHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHttpClient")
            .field("requests", &self.requests)
            .field("response_builder", &"<closure>")
            .finish()
    }
}

impl Clone for MockHttpClient {
    fn clone(&self) -> Self {
        Self {
            requests: Arc::clone(&self.requests),
            response_builder: Arc::clone(&self.response_builder),
        }
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, ClientError> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .map_err(|e| Box::new(e) as ClientError)?
            .to_vec();

        self.requests.lock().unwrap().push(MockRequest {
            method,
            uri,
            headers,
            body,
        });

        Ok((self.response_builder)())
    }
}

#[derive(Debug, Clone)]
enum StreamScript {
    Open(Vec<Result<Value, EngineError>>),
    /// Yield the chunks, then never produce another item.
    Stall(Vec<Value>),
    Refuse(EngineError),
}

#[derive(Debug, Default)]
struct Script {
    complete: VecDeque<Result<Value, EngineError>>,
    stream: VecDeque<StreamScript>,
    requests: Vec<EngineRequest>,
}

/// A completion engine that plays back queued outcomes in order.
///
/// Clones share the same queue, so a test can hand one clone to the code under test and inspect
/// the other. When a queue runs dry the engine fails with an unclassified error.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, response: Value) -> Self {
        self.script.lock().unwrap().complete.push_back(Ok(response));
        self
    }

    pub fn fail(self, kind: ErrorKind, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .complete
            .push_back(Err(EngineError::new(kind, message)));
        self
    }

    pub fn stream_chunks(self, chunks: Vec<Value>) -> Self {
        self.script
            .lock()
            .unwrap()
            .stream
            .push_back(StreamScript::Open(chunks.into_iter().map(Ok).collect()));
        self
    }

    /// Stream `chunks`, then end with an error item.
    pub fn stream_then_fail(self, chunks: Vec<Value>, kind: ErrorKind, message: &str) -> Self {
        let mut items: Vec<_> = chunks.into_iter().map(Ok).collect();
        items.push(Err(EngineError::new(kind, message)));
        self.script
            .lock()
            .unwrap()
            .stream
            .push_back(StreamScript::Open(items));
        self
    }

    /// Stream `chunks`, then hang without ending the stream.
    pub fn stream_then_stall(self, chunks: Vec<Value>) -> Self {
        self.script
            .lock()
            .unwrap()
            .stream
            .push_back(StreamScript::Stall(chunks));
        self
    }

    /// Refuse to open the stream at all.
    pub fn fail_stream(self, kind: ErrorKind, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .stream
            .push_back(StreamScript::Refuse(EngineError::new(kind, message)));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request the engine has been handed, in call order.
    pub fn requests(&self) -> Vec<EngineRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    fn exhausted() -> EngineError {
        EngineError::new(ErrorKind::Unclassified, "no scripted outcome left")
    }
}

#[async_trait]
impl CompletionEngine for ScriptedEngine {
    async fn complete(&self, request: &EngineRequest) -> Result<Value, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.requests.push(request.clone());
        script.complete.pop_front().unwrap_or_else(|| Err(Self::exhausted()))
    }

    async fn stream(&self, request: &EngineRequest) -> Result<ChunkStream, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.requests.push(request.clone());
        match script.stream.pop_front() {
            Some(StreamScript::Open(items)) => Ok(Box::pin(stream::iter(items))),
            Some(StreamScript::Stall(chunks)) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok)).chain(stream::pending()),
            )),
            Some(StreamScript::Refuse(e)) => Err(e),
            None => Err(Self::exhausted()),
        }
    }
}

/// Keeps every appended record in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<RequestRecord>>>,
    next_id: Arc<AtomicI64>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RequestRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Wait up to two seconds for at least `n` records, then return whatever is there.
    pub async fn wait_for(&self, n: usize) -> Vec<RequestRecord> {
        for _ in 0..200 {
            let records = self.records();
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.records()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn append(&self, record: RequestRecord) -> Result<i64, StoreError> {
        self.records.lock().unwrap().push(record);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// A sink whose writes always fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSink;

#[async_trait]
impl RecordSink for FailingSink {
    async fn append(&self, _record: RequestRecord) -> Result<i64, StoreError> {
        Err(StoreError::Poisoned)
    }
}
