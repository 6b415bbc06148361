//! SQLite-backed audit log
//!
//! One connection behind a mutex: writes serialize at the storage layer, and every query runs
//! on the blocking pool so request handling never waits on file I/O.
use super::filter::{Conditions, TimeFilter, format_timestamp, offset_modifier};
use super::stats::{
    DailyStats, DateRange, DayBucket, HourBucket, HourlyStats, ModelPerformance, ModelSlice,
    ModelUsage, ProviderUsage, RECENT_ERRORS, RecentError, RequestPage, RequestQuery, RequestRow,
    Stats, Totals, round_to,
};
use super::{RecordSink, RequestRecord, StoreError};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::types::ToSql;
use rusqlite::{Connection, params_from_iter};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    model TEXT NOT NULL,
    provider TEXT,
    prompt_tokens INTEGER,
    completion_tokens INTEGER,
    total_tokens INTEGER,
    cost REAL,
    duration_ms INTEGER,
    request_data TEXT,
    response_data TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_timestamp ON requests(timestamp);
CREATE INDEX IF NOT EXISTS idx_date_provider ON requests(DATE(timestamp), provider) WHERE error IS NULL;
CREATE INDEX IF NOT EXISTS idx_cost ON requests(cost) WHERE error IS NULL;
";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    location: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

fn count(value: Option<i64>) -> u64 {
    value.unwrap_or(0).max(0) as u64
}

/// Stored payloads are JSON text; anything unparseable is returned as a raw string.
fn payload(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::init(conn, path.display().to_string())
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        info!("Request log ready at {}", location);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            op(&conn)
        })
        .await?
    }

    /// Successful requests matching the query, newest first, with totals over all matches.
    pub async fn requests(&self, query: RequestQuery) -> Result<RequestPage, StoreError> {
        self.run(move |conn| list_requests(conn, &query)).await
    }

    pub async fn stats(&self, filter: TimeFilter) -> Result<Stats, StoreError> {
        self.run(move |conn| stats(conn, filter)).await
    }

    /// Per local day between `start` and `end` inclusive.
    pub async fn daily(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        offset_minutes: Option<i32>,
    ) -> Result<DailyStats, StoreError> {
        self.run(move |conn| daily(conn, start, end, offset_minutes))
            .await
    }

    /// Per local hour of one day. All 24 hours are present.
    pub async fn hourly(
        &self,
        date: NaiveDate,
        offset_minutes: Option<i32>,
    ) -> Result<HourlyStats, StoreError> {
        self.run(move |conn| hourly(conn, date, offset_minutes))
            .await
    }

    /// First and last UTC day with a successful request.
    pub async fn date_range(&self) -> Result<DateRange, StoreError> {
        self.run(|conn| {
            let (start_date, end_date) = conn.query_row(
                "SELECT MIN(DATE(timestamp)), MAX(DATE(timestamp)) FROM requests WHERE error IS NULL",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(DateRange {
                start_date,
                end_date,
            })
        })
        .await
    }

    /// Delete every failed-request record, returning how many were removed.
    pub async fn clear_errors(&self) -> Result<u64, StoreError> {
        let deleted = self
            .run(|conn| Ok(conn.execute("DELETE FROM requests WHERE error IS NOT NULL", [])?))
            .await?;
        info!("Cleared {} error records", deleted);
        Ok(deleted as u64)
    }
}

#[async_trait]
impl RecordSink for SqliteStore {
    async fn append(&self, record: RequestRecord) -> Result<i64, StoreError> {
        self.run(move |conn| insert(conn, &record)).await
    }
}

fn insert(conn: &Connection, record: &RequestRecord) -> Result<i64, StoreError> {
    let request = serde_json::to_string(&record.request)?;
    let response = record
        .outcome
        .response()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO requests (timestamp, model, provider, prompt_tokens, completion_tokens, total_tokens, cost, duration_ms, request_data, response_data, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            format_timestamp(&record.timestamp.naive_utc()),
            record.model_alias,
            record.provider,
            record.usage.prompt_tokens as i64,
            record.usage.completion_tokens as i64,
            record.usage.total_tokens as i64,
            record.cost_usd,
            record.duration_ms as i64,
            request,
            response,
            record.outcome.error(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, model = %record.model_alias, "Appended request record");
    Ok(id)
}

fn successful(filter: TimeFilter) -> Conditions {
    let mut conditions = Conditions::new();
    conditions.push_raw("error IS NULL");
    filter.apply(&mut conditions, Utc::now());
    conditions
}

fn list_requests(conn: &Connection, query: &RequestQuery) -> Result<RequestPage, StoreError> {
    let mut conditions = successful(query.time);
    if let Some(provider) = &query.provider {
        conditions.push("provider = ?", provider.clone());
    }
    if let Some(model) = &query.model {
        conditions.push("model = ?", model.clone());
    }
    if let Some(min_cost) = query.min_cost {
        conditions.push("cost >= ?", min_cost);
    }
    if let Some(max_cost) = query.max_cost {
        conditions.push("cost <= ?", max_cost);
    }
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = format!("%{search}%");
        let params: Vec<Box<dyn ToSql>> = vec![
            Box::new(pattern.clone()),
            Box::new(pattern.clone()),
            Box::new(pattern),
        ];
        conditions.push_many(
            "(model LIKE ? OR request_data LIKE ? OR response_data LIKE ?)",
            params,
        );
    }
    let where_sql = conditions.where_sql();

    let (total, total_tokens, total_cost, avg_cost): (i64, Option<i64>, Option<f64>, Option<f64>) =
        conn.query_row(
            &format!(
                "SELECT COUNT(*), SUM(total_tokens), SUM(cost), AVG(cost) FROM requests {where_sql}"
            ),
            params_from_iter(conditions.params()),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    let limit = query.page_size() as i64;
    let offset = query.offset as i64;
    let mut stmt = conn.prepare(&format!(
        "SELECT id, timestamp, model, provider, prompt_tokens, completion_tokens, total_tokens, cost, duration_ms, request_data, response_data
         FROM requests {where_sql} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?"
    ))?;
    let page_params = conditions
        .params()
        .chain([&limit as &dyn ToSql, &offset as &dyn ToSql]);
    let requests = stmt
        .query_map(params_from_iter(page_params), |row| {
            Ok(RequestRow {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                model: row.get(2)?,
                provider: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                prompt_tokens: count(row.get(4)?),
                completion_tokens: count(row.get(5)?),
                total_tokens: count(row.get(6)?),
                cost: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
                duration_ms: count(row.get(8)?),
                request_data: row
                    .get::<_, Option<String>>(9)?
                    .map(payload)
                    .unwrap_or(Value::Null),
                response_data: row.get::<_, Option<String>>(10)?.map(payload),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RequestPage {
        requests,
        total: count(Some(total)),
        total_tokens: count(total_tokens),
        total_cost: total_cost.unwrap_or(0.0),
        avg_cost: avg_cost.unwrap_or(0.0),
        offset: query.offset,
        limit: query.page_size(),
    })
}

fn stats(conn: &Connection, filter: TimeFilter) -> Result<Stats, StoreError> {
    let conditions = successful(filter);
    let where_sql = conditions.where_sql();

    let totals = conn.query_row(
        &format!(
            "SELECT COUNT(*), SUM(cost), SUM(prompt_tokens), SUM(completion_tokens), AVG(duration_ms)
             FROM requests {where_sql}"
        ),
        params_from_iter(conditions.params()),
        |row| {
            Ok(Totals {
                requests: count(row.get(0)?),
                cost: round_to(row.get::<_, Option<f64>>(1)?.unwrap_or(0.0), 4),
                prompt_tokens: count(row.get(2)?),
                completion_tokens: count(row.get(3)?),
                avg_duration_ms: round_to(row.get::<_, Option<f64>>(4)?.unwrap_or(0.0), 2),
            })
        },
    )?;

    let by_model = conn
        .prepare(&format!(
            "SELECT model, provider, COUNT(*), SUM(cost), SUM(total_tokens)
             FROM requests {where_sql} GROUP BY model, provider ORDER BY SUM(cost) DESC"
        ))?
        .query_map(params_from_iter(conditions.params()), |row| {
            Ok(ModelUsage {
                model: row.get(0)?,
                provider: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                requests: count(row.get(2)?),
                cost: round_to(row.get::<_, Option<f64>>(3)?.unwrap_or(0.0), 4),
                tokens: count(row.get(4)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let by_provider = conn
        .prepare(&format!(
            "SELECT provider, COUNT(*), SUM(cost), SUM(total_tokens)
             FROM requests {where_sql} GROUP BY provider ORDER BY SUM(cost) DESC"
        ))?
        .query_map(params_from_iter(conditions.params()), |row| {
            Ok(ProviderUsage {
                provider: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                requests: count(row.get(1)?),
                cost: round_to(row.get::<_, Option<f64>>(2)?.unwrap_or(0.0), 4),
                tokens: count(row.get(3)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut productive = successful(filter);
    productive.push_raw("completion_tokens > 0");
    productive.push_raw("duration_ms > 0");
    let rate = "CAST(completion_tokens AS REAL) / (CAST(duration_ms AS REAL) / 1000.0)";
    let performance = conn
        .prepare(&format!(
            "SELECT model, COUNT(*), AVG({rate}) AS avg_rate, AVG(duration_ms), MIN({rate}), MAX({rate}), AVG(cost)
             FROM requests {} GROUP BY model ORDER BY avg_rate DESC",
            productive.where_sql()
        ))?
        .query_map(params_from_iter(productive.params()), |row| {
            let rounded = |v: Option<f64>, places| round_to(v.unwrap_or(0.0), places);
            Ok(ModelPerformance {
                model: row.get(0)?,
                requests: count(row.get(1)?),
                avg_tokens_per_sec: rounded(row.get(2)?, 2),
                avg_duration_ms: rounded(row.get(3)?, 2),
                min_tokens_per_sec: rounded(row.get(4)?, 2),
                max_tokens_per_sec: rounded(row.get(5)?, 2),
                avg_cost_per_request: rounded(row.get(6)?, 6),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut failed = Conditions::new();
    failed.push_raw("error IS NOT NULL");
    filter.apply(&mut failed, Utc::now());
    let recent_errors = conn
        .prepare(&format!(
            "SELECT timestamp, model, error FROM requests {}
             ORDER BY timestamp DESC, id DESC LIMIT {RECENT_ERRORS}",
            failed.where_sql()
        ))?
        .query_map(params_from_iter(failed.params()), |row| {
            Ok(RecentError {
                timestamp: row.get(0)?,
                model: row.get(1)?,
                error: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stats {
        totals,
        by_model,
        by_provider,
        performance,
        recent_errors,
    })
}

/// Rows of `(bucket, provider, model, requests, cost, tokens)` for successful requests.
fn bucketed<K: rusqlite::types::FromSql>(
    conn: &Connection,
    bucket_expr: &str,
    conditions: &Conditions,
) -> Result<Vec<(K, ModelSlice, u64)>, StoreError> {
    let rows = conn
        .prepare(&format!(
            "SELECT {bucket_expr} AS bucket, provider, model, COUNT(*), SUM(cost), SUM(total_tokens)
             FROM requests {} GROUP BY bucket, provider, model ORDER BY bucket",
            conditions.where_sql()
        ))?
        .query_map(params_from_iter(conditions.params()), |row| {
            let slice = ModelSlice {
                provider: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                model: row.get(2)?,
                requests: count(row.get(3)?),
                cost: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
            };
            Ok((row.get(0)?, slice, count(row.get(5)?)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn day_range(start: NaiveDate, end: NaiveDate, offset_minutes: Option<i32>) -> Conditions {
    let filter = TimeFilter::DateRange {
        start: Some(start),
        end: Some(end),
        offset_minutes: offset_minutes.unwrap_or(0),
    };
    let mut conditions = Conditions::new();
    conditions.push_raw("error IS NULL");
    filter.apply(&mut conditions, Utc::now());
    conditions
}

fn daily(
    conn: &Connection,
    start: NaiveDate,
    end: NaiveDate,
    offset_minutes: Option<i32>,
) -> Result<DailyStats, StoreError> {
    let conditions = day_range(start, end, offset_minutes);
    let day_expr = match offset_minutes {
        Some(offset) => format!("DATE(timestamp, '{}')", offset_modifier(offset)),
        None => "DATE(timestamp)".to_string(),
    };

    let mut days: BTreeMap<String, DayBucket> = BTreeMap::new();
    for (date, slice, tokens) in bucketed::<String>(conn, &day_expr, &conditions)? {
        let day = days.entry(date.clone()).or_insert_with(|| DayBucket {
            date,
            requests: 0,
            cost: 0.0,
            total_tokens: 0,
            by_model: Vec::new(),
        });
        day.requests += slice.requests;
        day.cost += slice.cost;
        day.total_tokens += tokens;
        day.by_model.push(ModelSlice {
            cost: round_to(slice.cost, 4),
            ..slice
        });
    }

    let daily: Vec<DayBucket> = days
        .into_values()
        .rev()
        .map(|day| DayBucket {
            cost: round_to(day.cost, 4),
            ..day
        })
        .collect();

    Ok(DailyStats {
        total_days: daily.len() as u64,
        total_cost: round_to(daily.iter().map(|d| d.cost).sum(), 4),
        total_requests: daily.iter().map(|d| d.requests).sum(),
        daily,
    })
}

fn hourly(
    conn: &Connection,
    date: NaiveDate,
    offset_minutes: Option<i32>,
) -> Result<HourlyStats, StoreError> {
    let conditions = day_range(date, date, offset_minutes);
    let hour_expr = match offset_minutes {
        Some(offset) => format!(
            "CAST(strftime('%H', timestamp, '{}') AS INTEGER)",
            offset_modifier(offset)
        ),
        None => "CAST(strftime('%H', timestamp) AS INTEGER)".to_string(),
    };

    let mut hours: Vec<HourBucket> = (0..24).map(HourBucket::empty).collect();
    for (hour, slice, tokens) in bucketed::<i64>(conn, &hour_expr, &conditions)? {
        let Some(bucket) = usize::try_from(hour).ok().and_then(|h| hours.get_mut(h)) else {
            continue;
        };
        bucket.requests += slice.requests;
        bucket.cost += slice.cost;
        bucket.total_tokens += tokens;
        bucket.by_model.push(ModelSlice {
            cost: round_to(slice.cost, 4),
            ..slice
        });
    }
    for bucket in &mut hours {
        bucket.cost = round_to(bucket.cost, 4);
    }

    Ok(HourlyStats {
        total_cost: round_to(hours.iter().map(|h| h.cost).sum(), 4),
        total_requests: hours.iter().map(|h| h.requests).sum(),
        date: date.format("%Y-%m-%d").to_string(),
        hourly: hours,
    })
}
