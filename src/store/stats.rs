//! Read-side shapes returned by the store
use super::TimeFilter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PAGE_SIZE: u64 = 50;
pub const MAX_PAGE_SIZE: u64 = 200;
pub const RECENT_ERRORS: u32 = 10;

/// Round a USD amount for presentation.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Totals {
    pub requests: u64,
    pub cost: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelUsage {
    pub model: String,
    pub provider: String,
    pub requests: u64,
    pub cost: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderUsage {
    pub provider: String,
    pub requests: u64,
    pub cost: f64,
    pub tokens: u64,
}

/// Throughput of one model over successful requests that produced output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPerformance {
    pub model: String,
    pub requests: u64,
    pub avg_tokens_per_sec: f64,
    pub avg_duration_ms: f64,
    pub min_tokens_per_sec: f64,
    pub max_tokens_per_sec: f64,
    pub avg_cost_per_request: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecentError {
    pub timestamp: String,
    pub model: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stats {
    pub totals: Totals,
    pub by_model: Vec<ModelUsage>,
    pub by_provider: Vec<ProviderUsage>,
    pub performance: Vec<ModelPerformance>,
    pub recent_errors: Vec<RecentError>,
}

/// Filters for the request listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestQuery {
    pub time: TimeFilter,
    pub offset: u64,
    pub limit: u64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub min_cost: Option<f64>,
    pub max_cost: Option<f64>,
    /// Substring matched against the model and the stored payloads.
    pub search: Option<String>,
}

impl RequestQuery {
    pub fn page_size(&self) -> u64 {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRow {
    pub id: i64,
    pub timestamp: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub duration_ms: u64,
    pub request_data: Value,
    pub response_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPage {
    pub requests: Vec<RequestRow>,
    /// Aggregates over every matching row, not just this page.
    pub total: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_cost: f64,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSlice {
    pub provider: String,
    pub model: String,
    pub requests: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayBucket {
    pub date: String,
    pub requests: u64,
    pub cost: f64,
    pub total_tokens: u64,
    pub by_model: Vec<ModelSlice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyStats {
    /// Most recent day first.
    pub daily: Vec<DayBucket>,
    pub total_days: u64,
    pub total_cost: f64,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourBucket {
    pub hour: u32,
    pub requests: u64,
    pub cost: f64,
    pub total_tokens: u64,
    pub by_model: Vec<ModelSlice>,
}

impl HourBucket {
    pub fn empty(hour: u32) -> Self {
        Self {
            hour,
            requests: 0,
            cost: 0.0,
            total_tokens: 0,
            by_model: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourlyStats {
    /// Always 24 entries, hour 0 first.
    pub hourly: Vec<HourBucket>,
    pub date: String,
    pub total_cost: f64,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DateRange {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}
