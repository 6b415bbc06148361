/// Axum handlers for the proxy server
use crate::AppState;
use crate::dispatcher::SseStream;
use crate::errors::{error_response, json_rejection_response};
use crate::models::{ChatCompletionRequest, ModelList};
use crate::store::filter::parse_date;
use crate::store::stats::RequestQuery;
use crate::store::{StoreError, TimeFilter};
use axum::{
    Json,
    body::Body,
    extract::{Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, instrument, warn};

/// Days covered by `/stats/daily` when no start date is given.
const DEFAULT_DAILY_WINDOW: i64 = 30;

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub hours: Option<u32>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Minutes east of UTC.
    pub timezone_offset: Option<i32>,
}

impl StatsQuery {
    fn time_filter(&self) -> Result<TimeFilter, StoreError> {
        TimeFilter::from_params(
            self.hours,
            self.start_date.as_deref(),
            self.end_date.as_deref(),
            self.timezone_offset,
        )
    }
}

// Query strings can't be flattened into a shared struct without losing numeric parsing
#[derive(Debug, Default, Deserialize)]
pub struct RequestsQuery {
    pub hours: Option<u32>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub timezone_offset: Option<i32>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub min_cost: Option<f64>,
    pub max_cost: Option<f64>,
    pub search: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DailyQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub timezone_offset: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HourlyQuery {
    pub date: Option<String>,
    pub timezone_offset: Option<i32>,
}

fn store_failure(e: StoreError) -> Response {
    match e {
        StoreError::InvalidDate(value) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            &format!("Invalid date '{value}', expected YYYY-MM-DD"),
            "invalid_date",
        ),
        e => {
            error!("Store query failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                "Failed to query request log",
                "storage_error",
            )
        }
    }
}

/// The caller's current calendar day.
fn local_today(offset_minutes: Option<i32>) -> NaiveDate {
    (Utc::now().naive_utc() + Duration::minutes(offset_minutes.unwrap_or(0) as i64)).date()
}

fn event_stream(stream: SseStream) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Chat completions, streamed or not, for both the `/v1` and the bare path.
#[instrument(skip(state, payload))]
pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return json_rejection_response(rejection),
    };
    if request.model.is_empty() {
        warn!("Rejected request with empty model");
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "model must not be empty",
            "invalid_request",
        );
    }

    if request.is_streaming() {
        match state.dispatcher.stream(request).await {
            Ok(stream) => event_stream(stream),
            Err(e) => e.into_response(),
        }
    } else {
        match state.dispatcher.complete(request).await {
            Ok(response) => Json(response).into_response(),
            Err(e) => e.into_response(),
        }
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[instrument(skip(state))]
pub async fn models(State(state): State<AppState>) -> Json<ModelList> {
    let snapshot = state.dispatcher.aliases().snapshot();
    Json(ModelList::from_snapshot(&snapshot))
}

#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>, Query(query): Query<StatsQuery>) -> Response {
    let filter = match query.time_filter() {
        Ok(filter) => filter,
        Err(e) => return store_failure(e),
    };
    match state.store.stats(filter).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_failure(e),
    }
}

#[instrument(skip(state))]
pub async fn requests(
    State(state): State<AppState>,
    Query(query): Query<RequestsQuery>,
) -> Response {
    let time = match TimeFilter::from_params(
        query.hours,
        query.start_date.as_deref(),
        query.end_date.as_deref(),
        query.timezone_offset,
    ) {
        Ok(time) => time,
        Err(e) => return store_failure(e),
    };
    let filters = RequestQuery {
        time,
        offset: query.offset,
        limit: query.limit,
        provider: query.provider.filter(|s| !s.is_empty()),
        model: query.model.filter(|s| !s.is_empty()),
        min_cost: query.min_cost,
        max_cost: query.max_cost,
        search: query.search.filter(|s| !s.is_empty()),
    };
    match state.store.requests(filters).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => store_failure(e),
    }
}

#[instrument(skip(state))]
pub async fn daily_stats(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> Response {
    let parse = |value: Option<&str>| value.filter(|s| !s.is_empty()).map(parse_date).transpose();
    let (start, end) = match (
        parse(query.start_date.as_deref()),
        parse(query.end_date.as_deref()),
    ) {
        (Ok(start), Ok(end)) => {
            let end = end.unwrap_or_else(|| local_today(query.timezone_offset));
            let start = start.unwrap_or(end - Duration::days(DEFAULT_DAILY_WINDOW));
            (start, end)
        }
        (Err(e), _) | (_, Err(e)) => return store_failure(e),
    };
    match state.store.daily(start, end, query.timezone_offset).await {
        Ok(daily) => Json(daily).into_response(),
        Err(e) => store_failure(e),
    }
}

#[instrument(skip(state))]
pub async fn hourly_stats(
    State(state): State<AppState>,
    Query(query): Query<HourlyQuery>,
) -> Response {
    let date = match query.date.as_deref().filter(|s| !s.is_empty()) {
        Some(date) => match parse_date(date) {
            Ok(date) => date,
            Err(e) => return store_failure(e),
        },
        None => local_today(query.timezone_offset),
    };
    match state.store.hourly(date, query.timezone_offset).await {
        Ok(hourly) => Json(hourly).into_response(),
        Err(e) => store_failure(e),
    }
}

#[instrument(skip(state))]
pub async fn date_range(State(state): State<AppState>) -> Response {
    match state.store.date_range().await {
        Ok(range) => Json(range).into_response(),
        Err(e) => store_failure(e),
    }
}

#[instrument(skip(state))]
pub async fn clear_errors(State(state): State<AppState>) -> Response {
    match state.store.clear_errors().await {
        Ok(deleted) => Json(json!({"deleted": deleted})).into_response(),
        Err(e) => store_failure(e),
    }
}
