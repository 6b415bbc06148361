//! Retry policy for retryable engine failures.
//!
//! This is the only retry loop in the request path. The number of retries comes from the
//! request (already merged from client, alias and global defaults), falling back to the policy
//! default. Only the opening of a stream is retried; once chunks flow, failures are final.
use super::{ChunkStream, CompletionEngine, EngineRequest};
use crate::errors::EngineError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Retrying<E> {
    inner: E,
    default_retries: u32,
    base_backoff: Duration,
}

impl<E: CompletionEngine> Retrying<E> {
    pub fn new(inner: E, default_retries: u32) -> Self {
        Self {
            inner,
            default_retries,
            base_backoff: Duration::from_millis(500),
        }
    }

    /// Base delay before the first retry; doubles on each subsequent attempt.
    pub fn with_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << attempt.min(16))
    }

    async fn run<'a, T, F, Fut>(&'a self, request: &'a EngineRequest, call: F) -> Result<T, EngineError>
    where
        F: Fn(&'a E, &'a EngineRequest) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let max_retries = request.max_retries.get().unwrap_or(self.default_retries);
        let mut attempt = 0;
        loop {
            match call(&self.inner, request).await {
                Err(e) if e.kind.is_retryable() && attempt < max_retries => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        model = %request.model,
                        attempt,
                        max_retries,
                        "Retrying after {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<E: CompletionEngine> CompletionEngine for Retrying<E> {
    async fn complete(&self, request: &EngineRequest) -> Result<Value, EngineError> {
        self.run(request, |engine, request| engine.complete(request))
            .await
    }

    async fn stream(&self, request: &EngineRequest) -> Result<ChunkStream, EngineError> {
        self.run(request, |engine, request| engine.stream(request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StreamMode;
    use crate::errors::ErrorKind;
    use crate::params::Param;
    use crate::test_utils::ScriptedEngine;
    use serde_json::json;

    fn request(retries: Param<u32>) -> EngineRequest {
        let mut request = EngineRequest::new("gpt-4", vec![], StreamMode::Complete);
        request.max_retries = retries;
        request
    }

    #[tokio::test]
    async fn test_retries_retryable_errors_until_success() {
        let engine = ScriptedEngine::new()
            .fail(ErrorKind::RateLimited, "slow down")
            .fail(ErrorKind::Unavailable, "overloaded")
            .respond(json!({"ok": true}));
        let retrying = Retrying::new(engine.clone(), 3).with_backoff(Duration::ZERO);

        let response = retrying.complete(&request(Param::Unset)).await.unwrap();

        assert_eq!(response, json!({"ok": true}));
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let engine = ScriptedEngine::new()
            .fail(ErrorKind::Timeout, "1")
            .fail(ErrorKind::Timeout, "2")
            .respond(json!({"ok": true}));
        let retrying = Retrying::new(engine.clone(), 3).with_backoff(Duration::ZERO);

        let err = retrying
            .complete(&request(Param::Explicit(1)))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_explicit_zero_retries_disables_retrying() {
        let engine = ScriptedEngine::new()
            .fail(ErrorKind::RateLimited, "slow down")
            .respond(json!({"ok": true}));
        let retrying = Retrying::new(engine.clone(), 3).with_backoff(Duration::ZERO);

        let err = retrying
            .complete(&request(Param::Explicit(0)))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_surface_immediately() {
        let engine = ScriptedEngine::new()
            .fail(ErrorKind::Authentication, "bad key")
            .respond(json!({"ok": true}));
        let retrying = Retrying::new(engine.clone(), 3).with_backoff(Duration::ZERO);

        let err = retrying.complete(&request(Param::Unset)).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let retrying = Retrying::new(ScriptedEngine::new(), 3).with_backoff(Duration::from_millis(100));
        assert_eq!(retrying.backoff(0), Duration::from_millis(100));
        assert_eq!(retrying.backoff(2), Duration::from_millis(400));
    }
}
