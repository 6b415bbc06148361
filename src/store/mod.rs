//! The audit log of dispatch attempts
//!
//! Every attempt ends in exactly one [`RequestRecord`] handed to a [`RecordSink`]. The SQLite
//! store is the production sink and also serves the aggregate read endpoints.
pub mod filter;
pub mod sqlite;
pub mod stats;

pub use filter::TimeFilter;
pub use sqlite::SqliteStore;

use crate::pricing::Usage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
}

/// How a dispatch attempt ended. Exactly one of response or error is ever recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(String),
}

impl Outcome {
    pub fn response(&self) -> Option<&Value> {
        match self {
            Outcome::Success(response) => Some(response),
            Outcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(message) => Some(message),
        }
    }
}

/// One dispatch attempt. Built once at the end of the attempt and never changed.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub model_alias: String,
    pub provider: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// The resolved request, without credentials.
    pub request: Value,
    pub outcome: Outcome,
}

#[async_trait]
pub trait RecordSink: std::fmt::Debug + Send + Sync {
    /// Durably append a record, returning its id. Ids increase monotonically.
    async fn append(&self, record: RequestRecord) -> Result<i64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_sets_exactly_one_side() {
        let ok = Outcome::Success(json!({"id": "x"}));
        assert!(ok.response().is_some() && ok.error().is_none());

        let failed = Outcome::Failure("Timeout: slow".into());
        assert!(failed.response().is_none());
        assert_eq!(failed.error(), Some("Timeout: slow"));
    }
}
