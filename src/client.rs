//! HTTP client used by the upstream engine
//!
//! The trait lets tests swap in a canned client; production uses a pooled hyper client.
use async_trait::async_trait;
use axum::response::IntoResponse;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use std::time::Duration;

pub type HyperClient = Client<
    hyper_tls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    axum::body::Body,
>;

pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, ClientError>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, ClientError> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as ClientError)
    }
}

/// Connection pool tuning for the upstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 100,
        }
    }
}

pub fn create_hyper_client(pool: PoolSettings) -> HyperClient {
    let https = hyper_tls::HttpsConnector::new();

    tracing::debug!(
        "Upstream pool config: idle_timeout={:?}, max_idle_per_host={}",
        pool.idle_timeout,
        pool.max_idle_per_host
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(pool.idle_timeout)
        .pool_max_idle_per_host(pool.max_idle_per_host)
        .pool_timer(hyper_util::rt::TokioTimer::new())
        .build(https)
}
